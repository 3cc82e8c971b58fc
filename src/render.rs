use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::expr::{BinOp, BinRel, Expr, SymExpr, UnOp};
use crate::insn::Instruction;

/// Classified fragment of rendered output, for listeners that colorize
/// or hyperlink (a UI, an HTML dump). Concatenating the fragments gives
/// the plain-text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Mnemonic(String),
    Register(String),
    Constant(String),
    Address(String),
    Memory(String),
    Literal(String),
}

impl Token {
    pub fn text(&self) -> &str {
        match self {
            Token::Mnemonic(s)
            | Token::Register(s)
            | Token::Constant(s)
            | Token::Address(s)
            | Token::Memory(s)
            | Token::Literal(s) => s,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Token stream for an expression; parenthesization matches `Display`.
pub fn expr_tokens(expr: &SymExpr) -> Vec<Token> {
    let mut out = Vec::new();
    walk(expr, 12, &mut out);
    out
}

fn level(expr: &SymExpr) -> u8 {
    match &**expr {
        Expr::Val(_) | Expr::Reg(_) | Expr::Ext(_) | Expr::Top(_) | Expr::Mem(..) => 1,
        Expr::Extract(..) => 1,
        Expr::BinOp(BinOp::Rol | BinOp::Ror, _, _) => 1,
        Expr::UnOp(..) => 2,
        Expr::BinOp(
            BinOp::Mul | BinOp::Div | BinOp::Sdiv | BinOp::Rem | BinOp::Srem,
            _,
            _,
        ) => 3,
        Expr::BinOp(BinOp::Add | BinOp::Sub, _, _) => 4,
        Expr::BinOp(BinOp::Shl | BinOp::Shr | BinOp::Sar, _, _) => 5,
        Expr::BinRel(BinRel::Eq | BinRel::Ne, _, _) => 7,
        Expr::BinRel(..) => 6,
        Expr::BinOp(BinOp::And, _, _) => 8,
        Expr::BinOp(BinOp::Xor, _, _) => 9,
        Expr::BinOp(BinOp::Or, _, _) => 10,
        Expr::Compose(_) => 11,
        Expr::Tst(..) => 12,
    }
}

fn binop_text(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => " + ",
        BinOp::Sub => " - ",
        BinOp::Mul => " * ",
        BinOp::Div => " / ",
        BinOp::Sdiv => " s/ ",
        BinOp::Rem => " % ",
        BinOp::Srem => " s% ",
        BinOp::And => " & ",
        BinOp::Or => " | ",
        BinOp::Xor => " ^ ",
        BinOp::Shl => " << ",
        BinOp::Shr => " >> ",
        BinOp::Sar => " s>> ",
        BinOp::Rol | BinOp::Ror => unreachable!("function-style rendering"),
    }
}

fn binrel_text(op: BinRel) -> &'static str {
    match op {
        BinRel::Eq => " == ",
        BinRel::Ne => " != ",
        BinRel::Ltu => " < ",
        BinRel::Leu => " <= ",
        BinRel::Lts => " s< ",
        BinRel::Les => " s<= ",
        BinRel::Gtu => " > ",
        BinRel::Geu => " >= ",
        BinRel::Gts => " s> ",
        BinRel::Ges => " s>= ",
    }
}

fn walk(expr: &SymExpr, parent: u8, out: &mut Vec<Token>) {
    let lv = level(expr);
    let wrap = lv > parent;
    if wrap {
        out.push(Token::Literal("(".into()));
    }
    match &**expr {
        Expr::Val(c) => out.push(Token::Constant(format!("{}", c))),
        Expr::Reg(r) => out.push(Token::Register(r.name().to_owned())),
        Expr::Ext(x) => out.push(Token::Address(format!("{}", x))),
        Expr::Top(sz) => out.push(Token::Literal(format!("T{}", sz))),
        Expr::Mem(p, sz, _) => out.push(Token::Memory(format!("M{}({})", sz, p))),
        Expr::Extract(e, lo, hi) => {
            walk(e, 1, out);
            out.push(Token::Literal(format!("[{}:{}]", lo, hi)));
        }
        Expr::BinOp(op @ (BinOp::Rol | BinOp::Ror), l, r) => {
            let name = if *op == BinOp::Rol { "rol(" } else { "ror(" };
            out.push(Token::Literal(name.into()));
            walk(l, 12, out);
            out.push(Token::Literal(", ".into()));
            walk(r, 12, out);
            out.push(Token::Literal(")".into()));
        }
        Expr::UnOp(op, e) => {
            out.push(Token::Literal(
                match op {
                    UnOp::Neg => "-",
                    UnOp::Not => "~",
                }
                .into(),
            ));
            walk(e, 1, out);
        }
        Expr::BinOp(op, l, r) => {
            walk(l, lv, out);
            out.push(Token::Literal(binop_text(*op).into()));
            walk(r, lv - 1, out);
        }
        Expr::BinRel(op, l, r) => {
            walk(l, lv, out);
            out.push(Token::Literal(binrel_text(*op).into()));
            walk(r, lv - 1, out);
        }
        Expr::Compose(parts) => {
            for (i, p) in parts.iter().rev().enumerate() {
                if i > 0 {
                    out.push(Token::Literal(" ++ ".into()));
                }
                walk(p, lv - 1, out);
            }
        }
        Expr::Tst(c, t, f) => {
            out.push(Token::Literal("if ".into()));
            walk(c, lv, out);
            out.push(Token::Literal(" then ".into()));
            walk(t, lv, out);
            out.push(Token::Literal(" else ".into()));
            walk(f, lv, out);
        }
    }
    if wrap {
        out.push(Token::Literal(")".into()));
    }
}

pub type FormatFn = fn(&Instruction) -> Vec<Token>;

/// Default rendering: lowercase mnemonic, operands comma-separated.
pub fn default_format(insn: &Instruction) -> Vec<Token> {
    let mut out = vec![Token::Mnemonic(
        insn.mnemonic().unwrap_or("(bad)").to_lowercase(),
    )];
    for (i, op) in insn.operands().iter().enumerate() {
        if i > 0 {
            out.push(Token::Literal(", ".into()));
        }
        out.extend(expr_tokens(op));
    }
    out
}

/// Instruction renderer with per-mnemonic overrides, for encodings whose
/// canonical syntax the generic form cannot express.
#[derive(Debug, Clone, Default)]
pub struct Formatter {
    overrides: FnvHashMap<Arc<str>, FormatFn>,
}

impl Formatter {
    pub fn new() -> Formatter {
        Formatter::default()
    }

    pub fn set<S: AsRef<str>>(&mut self, mnemonic: S, f: FormatFn) {
        self.overrides.insert(Arc::from(mnemonic.as_ref()), f);
    }

    pub fn tokens(&self, insn: &Instruction) -> Vec<Token> {
        let f = insn
            .mnemonic()
            .and_then(|m| self.overrides.get(m).copied())
            .unwrap_or(default_format as FormatFn);
        f(insn)
    }

    /// One line of text; a space separates the mnemonic from the rest.
    pub fn line(&self, insn: &Instruction) -> String {
        let mut out = String::new();
        for (i, tok) in self.tokens(insn).iter().enumerate() {
            if i == 1 {
                out.push(' ');
            }
            out.push_str(tok.text());
        }
        out
    }
}
