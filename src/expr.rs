use std::fmt;
use std::ops::Deref;
use std::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Neg, Not, Rem, Shl, Shr, Sub};
use std::sync::Arc;

use hashconsing::{consign, HConsed, HashConsign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

use crate::bits::Endian;

consign! {
    let EXPR = consign(100 * 1024 /* = capacity */) for Expr;
}

/// Sized constant; the value is kept reduced modulo 2^size. Widths above
/// 128 bits only arise through `Compose`, never in a single constant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Const {
    val: u128,
    size: u32,
    signed: bool,
}

fn width_mask(size: u32) -> u128 {
    if size >= 128 {
        !0u128
    } else {
        (1u128 << size) - 1
    }
}

impl Const {
    pub fn new(val: u128, size: u32) -> Const {
        assert!(size >= 1 && size <= 128);
        Const {
            val: val & width_mask(size),
            size,
            signed: false,
        }
    }

    pub fn from_i128(val: i128, size: u32) -> Const {
        let mut c = Const::new(val as u128, size);
        c.signed = true;
        c
    }

    pub fn signed(mut self) -> Const {
        self.signed = true;
        self
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn value(&self) -> u128 {
        self.val
    }

    /// Signed interpretation, regardless of the display flag.
    pub fn int(&self) -> i128 {
        if self.size < 128 && self.val >> (self.size - 1) & 1 == 1 {
            (self.val | !width_mask(self.size)) as i128
        } else {
            self.val as i128
        }
    }

    pub fn is_zero(&self) -> bool {
        self.val == 0
    }

    pub fn is_one(&self) -> bool {
        self.val == 1
    }

    pub fn is_ones(&self) -> bool {
        self.val == width_mask(self.size)
    }

    fn bin(&self, rhs: &Const, val: u128) -> Const {
        assert_eq!(self.size, rhs.size);
        Const {
            val: val & width_mask(self.size),
            size: self.size,
            signed: self.signed && rhs.signed,
        }
    }

    pub fn add(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val.wrapping_add(rhs.val))
    }

    pub fn sub(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val.wrapping_sub(rhs.val))
    }

    pub fn mul(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val.wrapping_mul(rhs.val))
    }

    pub fn divu(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val / rhs.val)
    }

    pub fn divs(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.int().wrapping_div(rhs.int()) as u128)
    }

    pub fn remu(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val % rhs.val)
    }

    pub fn rems(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.int().wrapping_rem(rhs.int()) as u128)
    }

    pub fn and(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val & rhs.val)
    }

    pub fn or(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val | rhs.val)
    }

    pub fn xor(&self, rhs: &Const) -> Const {
        self.bin(rhs, self.val ^ rhs.val)
    }

    pub fn shl(&self, amount: u32) -> Const {
        let val = if amount >= self.size {
            0
        } else {
            self.val << amount
        };
        Const::new(val, self.size)
    }

    pub fn shr(&self, amount: u32) -> Const {
        let val = if amount >= self.size {
            0
        } else {
            self.val >> amount
        };
        Const::new(val, self.size)
    }

    pub fn sar(&self, amount: u32) -> Const {
        let amount = amount.min(self.size - 1);
        Const::new((self.int() >> amount) as u128, self.size)
    }

    pub fn rol(&self, amount: u32) -> Const {
        let amount = amount % self.size;
        if amount == 0 {
            return self.clone();
        }
        Const::new(
            self.val << amount | self.val >> (self.size - amount),
            self.size,
        )
    }

    pub fn ror(&self, amount: u32) -> Const {
        self.rol(self.size - amount % self.size)
    }

    pub fn not(&self) -> Const {
        Const {
            val: !self.val & width_mask(self.size),
            ..*self
        }
    }

    pub fn neg(&self) -> Const {
        Const {
            val: self.val.wrapping_neg() & width_mask(self.size),
            ..*self
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.signed && self.int() < 0 {
            write!(f, "-{:#x}", self.int().unsigned_abs())
        } else {
            write!(f, "{:#x}", self.val)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegKind {
    Std,
    Pc,
    Stack,
    Flags,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reg {
    name: Arc<str>,
    size: u32,
    kind: RegKind,
}

impl Reg {
    pub fn new<S: AsRef<str>>(name: S, size: u32) -> Reg {
        Reg {
            name: Arc::from(name.as_ref()),
            size,
            kind: RegKind::Std,
        }
    }

    pub fn kind(mut self, kind: RegKind) -> Reg {
        self.kind = kind;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_general(&self) -> bool {
        self.kind == RegKind::Std
    }

    pub fn is_pc(&self) -> bool {
        self.kind == RegKind::Pc
    }

    pub fn is_stack(&self) -> bool {
        self.kind == RegKind::Stack
    }

    pub fn is_flags(&self) -> bool {
        self.kind == RegKind::Flags
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// External symbol (import, unresolved relocation target).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ext {
    name: Arc<str>,
    size: u32,
}

impl Ext {
    pub fn new<S: AsRef<str>>(name: S, size: u32) -> Ext {
        Ext {
            name: Arc::from(name.as_ref()),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl fmt::Display for Ext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name)
    }
}

/// Address of a memory expression: symbolic base, optional segment
/// selector, concrete displacement. Constant offsets in the base fold
/// into the displacement on construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ptr {
    base: SymExpr,
    seg: Option<Arc<str>>,
    disp: i64,
}

impl Ptr {
    pub fn new(base: SymExpr, disp: i64) -> Ptr {
        let (base, off) = base.unoffset();
        Ptr {
            base,
            seg: None,
            disp: disp.wrapping_add(off),
        }
    }

    pub fn seg<S: AsRef<str>>(mut self, seg: S) -> Ptr {
        self.seg = Some(Arc::from(seg.as_ref()));
        self
    }

    pub fn base(&self) -> &SymExpr {
        &self.base
    }

    pub fn segment(&self) -> Option<&str> {
        self.seg.as_deref()
    }

    pub fn disp(&self) -> i64 {
        self.disp
    }

    pub fn size(&self) -> u32 {
        self.base.bits()
    }

    pub fn offset(&self, off: i64) -> Ptr {
        Ptr {
            disp: self.disp.wrapping_add(off),
            ..self.clone()
        }
    }

    pub fn with_base(&self, base: SymExpr) -> Ptr {
        let (base, off) = base.unoffset();
        Ptr {
            base,
            seg: self.seg.clone(),
            disp: self.disp.wrapping_add(off),
        }
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref seg) = self.seg {
            write!(f, "{}:", seg)?;
        }
        write!(f, "{}", self.base)?;
        if self.disp > 0 {
            write!(f, "+{:#x}", self.disp)?;
        } else if self.disp < 0 {
            write!(f, "-{:#x}", self.disp.unsigned_abs())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Sdiv,
    Rem,
    Srem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

impl BinOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor
        )
    }
}

/// Comparisons produce 1-bit expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinRel {
    Eq,
    Ne,
    Ltu,
    Lts,
    Leu,
    Les,
    Gtu,
    Gts,
    Geu,
    Ges,
}

impl BinRel {
    pub fn inverse(self) -> BinRel {
        match self {
            BinRel::Eq => BinRel::Ne,
            BinRel::Ne => BinRel::Eq,
            BinRel::Ltu => BinRel::Geu,
            BinRel::Lts => BinRel::Ges,
            BinRel::Leu => BinRel::Gtu,
            BinRel::Les => BinRel::Gts,
            BinRel::Gtu => BinRel::Leu,
            BinRel::Gts => BinRel::Les,
            BinRel::Geu => BinRel::Ltu,
            BinRel::Ges => BinRel::Lts,
        }
    }

    /// Truth value of `e <rel> e`.
    fn on_equal(self) -> bool {
        matches!(
            self,
            BinRel::Eq | BinRel::Leu | BinRel::Les | BinRel::Geu | BinRel::Ges
        )
    }

    fn eval_cst(self, l: &Const, r: &Const) -> bool {
        match self {
            BinRel::Eq => l.value() == r.value(),
            BinRel::Ne => l.value() != r.value(),
            BinRel::Ltu => l.value() < r.value(),
            BinRel::Leu => l.value() <= r.value(),
            BinRel::Gtu => l.value() > r.value(),
            BinRel::Geu => l.value() >= r.value(),
            BinRel::Lts => l.int() < r.int(),
            BinRel::Les => l.int() <= r.int(),
            BinRel::Gts => l.int() > r.int(),
            BinRel::Ges => l.int() >= r.int(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SymExpr(HConsed<Expr>);

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl Deref for SymExpr {
    type Target = Expr;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl From<Const> for SymExpr {
    fn from(c: Const) -> Self {
        SymExpr::val(c)
    }
}

impl From<Reg> for SymExpr {
    fn from(r: Reg) -> Self {
        SymExpr::reg(r)
    }
}

impl From<Ext> for SymExpr {
    fn from(e: Ext) -> Self {
        SymExpr::ext(e)
    }
}

impl From<Expr> for SymExpr {
    fn from(e: Expr) -> Self {
        Self(EXPR.mk(e))
    }
}

impl From<HConsed<Expr>> for SymExpr {
    fn from(e: HConsed<Expr>) -> Self {
        Self(e)
    }
}

impl Serialize for SymExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (**self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SymExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Expr::deserialize(deserializer).map(SymExpr::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Expr {
    UnOp(UnOp, SymExpr),              // T -> T
    BinOp(BinOp, SymExpr, SymExpr),   // T * T -> T
    BinRel(BinRel, SymExpr, SymExpr), // T * T -> 1

    Extract(SymExpr, u32, u32),      // T[lo..hi) -> hi - lo
    Compose(SmallVec<[SymExpr; 4]>), // LSB-first parts

    Tst(SymExpr, SymExpr, SymExpr), // 1 * T * T -> T

    Mem(Ptr, u32, Endian), // memory cell of the given bit width

    Val(Const),
    Reg(Reg),
    Ext(Ext),
    Top(u32), // unknown of the given bit width
}

impl Expr {
    fn fmt_l1(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Val(v) => write!(f, "{}", v),
            Expr::Reg(r) => write!(f, "{}", r),
            Expr::Ext(x) => write!(f, "{}", x),
            Expr::Top(sz) => write!(f, "T{}", sz),
            Expr::Mem(p, sz, _) => write!(f, "M{}({})", sz, p),
            Expr::Extract(e, lo, hi) => {
                e.fmt_l1(f)?;
                write!(f, "[{}:{}]", lo, hi)
            }
            Expr::BinOp(BinOp::Rol, e1, e2) => write!(f, "rol({}, {})", e1, e2),
            Expr::BinOp(BinOp::Ror, e1, e2) => write!(f, "ror({}, {})", e1, e2),
            expr => write!(f, "({})", expr),
        }
    }

    fn fmt_l2(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::UnOp(UnOp::Neg, expr) => {
                write!(f, "-")?;
                expr.fmt_l1(f)
            }
            Expr::UnOp(UnOp::Not, expr) => {
                write!(f, "~")?;
                expr.fmt_l1(f)
            }
            expr => expr.fmt_l1(f),
        }
    }

    fn fmt_l3(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinOp(BinOp::Mul, e1, e2) => {
                e1.fmt_l3(f)?;
                write!(f, " * ")?;
                e2.fmt_l2(f)
            }
            Expr::BinOp(BinOp::Div, e1, e2) => {
                e1.fmt_l3(f)?;
                write!(f, " / ")?;
                e2.fmt_l2(f)
            }
            Expr::BinOp(BinOp::Sdiv, e1, e2) => {
                e1.fmt_l3(f)?;
                write!(f, " s/ ")?;
                e2.fmt_l2(f)
            }
            Expr::BinOp(BinOp::Rem, e1, e2) => {
                e1.fmt_l3(f)?;
                write!(f, " % ")?;
                e2.fmt_l2(f)
            }
            Expr::BinOp(BinOp::Srem, e1, e2) => {
                e1.fmt_l3(f)?;
                write!(f, " s% ")?;
                e2.fmt_l2(f)
            }
            expr => expr.fmt_l2(f),
        }
    }

    fn fmt_l4(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinOp(BinOp::Add, e1, e2) => {
                e1.fmt_l4(f)?;
                write!(f, " + ")?;
                e2.fmt_l3(f)
            }
            Expr::BinOp(BinOp::Sub, e1, e2) => {
                e1.fmt_l4(f)?;
                write!(f, " - ")?;
                e2.fmt_l3(f)
            }
            expr => expr.fmt_l3(f),
        }
    }

    fn fmt_l5(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinOp(BinOp::Shl, e1, e2) => {
                e1.fmt_l5(f)?;
                write!(f, " << ")?;
                e2.fmt_l4(f)
            }
            Expr::BinOp(BinOp::Shr, e1, e2) => {
                e1.fmt_l5(f)?;
                write!(f, " >> ")?;
                e2.fmt_l4(f)
            }
            Expr::BinOp(BinOp::Sar, e1, e2) => {
                e1.fmt_l5(f)?;
                write!(f, " s>> ")?;
                e2.fmt_l4(f)
            }
            expr => expr.fmt_l4(f),
        }
    }

    fn fmt_l6(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinRel(BinRel::Ltu, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " < ")?;
                e2.fmt_l5(f)
            }
            Expr::BinRel(BinRel::Leu, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " <= ")?;
                e2.fmt_l5(f)
            }
            Expr::BinRel(BinRel::Lts, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " s< ")?;
                e2.fmt_l5(f)
            }
            Expr::BinRel(BinRel::Les, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " s<= ")?;
                e2.fmt_l5(f)
            }
            Expr::BinRel(BinRel::Gtu, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " > ")?;
                e2.fmt_l5(f)
            }
            Expr::BinRel(BinRel::Geu, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " >= ")?;
                e2.fmt_l5(f)
            }
            Expr::BinRel(BinRel::Gts, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " s> ")?;
                e2.fmt_l5(f)
            }
            Expr::BinRel(BinRel::Ges, e1, e2) => {
                e1.fmt_l6(f)?;
                write!(f, " s>= ")?;
                e2.fmt_l5(f)
            }
            expr => expr.fmt_l5(f),
        }
    }

    fn fmt_l7(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinRel(BinRel::Eq, e1, e2) => {
                e1.fmt_l7(f)?;
                write!(f, " == ")?;
                e2.fmt_l6(f)
            }
            Expr::BinRel(BinRel::Ne, e1, e2) => {
                e1.fmt_l7(f)?;
                write!(f, " != ")?;
                e2.fmt_l6(f)
            }
            expr => expr.fmt_l6(f),
        }
    }

    fn fmt_l8(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::BinOp(BinOp::And, e1, e2) = self {
            e1.fmt_l8(f)?;
            write!(f, " & ")?;
            e2.fmt_l7(f)
        } else {
            self.fmt_l7(f)
        }
    }

    fn fmt_l9(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::BinOp(BinOp::Xor, e1, e2) = self {
            e1.fmt_l9(f)?;
            write!(f, " ^ ")?;
            e2.fmt_l8(f)
        } else {
            self.fmt_l8(f)
        }
    }

    fn fmt_l10(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::BinOp(BinOp::Or, e1, e2) = self {
            e1.fmt_l10(f)?;
            write!(f, " | ")?;
            e2.fmt_l9(f)
        } else {
            self.fmt_l9(f)
        }
    }

    fn fmt_l11(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::Compose(parts) = self {
            // rendered MSB-first
            for (i, p) in parts.iter().rev().enumerate() {
                if i > 0 {
                    write!(f, " ++ ")?;
                }
                p.fmt_l10(f)?;
            }
            Ok(())
        } else {
            self.fmt_l10(f)
        }
    }

    fn fmt_l12(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::Tst(c, e1, e2) = self {
            write!(f, "if ")?;
            c.fmt_l12(f)?;
            write!(f, " then ")?;
            e1.fmt_l12(f)?;
            write!(f, " else ")?;
            e2.fmt_l12(f)
        } else {
            self.fmt_l11(f)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_l12(f)
    }
}

impl From<bool> for Expr {
    fn from(t: bool) -> Expr {
        Expr::Val(Const::new(t as u128, 1))
    }
}

impl From<Const> for Expr {
    fn from(c: Const) -> Expr {
        Expr::Val(c)
    }
}

impl SymExpr {
    pub fn val<T: Into<Expr>>(t: T) -> SymExpr {
        EXPR.mk(t.into()).into()
    }

    pub fn cst(val: u128, bits: u32) -> SymExpr {
        Self::val(Const::new(val, bits))
    }

    pub fn cst_signed(val: i128, bits: u32) -> SymExpr {
        Self::val(Const::from_i128(val, bits))
    }

    pub fn reg(reg: Reg) -> SymExpr {
        EXPR.mk(Expr::Reg(reg)).into()
    }

    pub fn ext(ext: Ext) -> SymExpr {
        EXPR.mk(Expr::Ext(ext)).into()
    }

    pub fn top(bits: u32) -> SymExpr {
        EXPR.mk(Expr::Top(bits)).into()
    }

    pub fn mem(ptr: Ptr, bits: u32, endian: Endian) -> SymExpr {
        EXPR.mk(Expr::Mem(ptr, bits, endian)).into()
    }

    pub fn lift_unop(op: UnOp, v: SymExpr) -> SymExpr {
        EXPR.mk(Expr::UnOp(op, v)).into()
    }

    pub fn lift_binop(op: BinOp, l: SymExpr, r: SymExpr) -> SymExpr {
        if !matches!(
            op,
            BinOp::Shl | BinOp::Shr | BinOp::Sar | BinOp::Rol | BinOp::Ror
        ) {
            assert_eq!(l.bits(), r.bits());
        }
        EXPR.mk(Expr::BinOp(op, l, r)).into()
    }

    pub fn lift_binrel(op: BinRel, l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        EXPR.mk(Expr::BinRel(op, l, r)).into()
    }

    // constants to the right of commutative operators, remaining operands
    // in interning order, so equal terms built in any order coincide
    fn sort_comm(l: SymExpr, r: SymExpr) -> (SymExpr, SymExpr) {
        if (l.is_val() && !r.is_val()) || (!l.is_val() && !r.is_val() && l > r) {
            (r, l)
        } else {
            (l, r)
        }
    }

    pub fn neg(v: SymExpr) -> SymExpr {
        if let Expr::Val(ref c) = &*v {
            Self::val(c.neg())
        } else if let Expr::UnOp(UnOp::Neg, ref vv) = &*v {
            vv.clone()
        } else if v.is_top() {
            Self::top(v.bits())
        } else {
            Self::lift_unop(UnOp::Neg, v)
        }
    }

    pub fn not(v: SymExpr) -> SymExpr {
        if let Expr::Val(ref c) = &*v {
            Self::val(c.not())
        } else if let Expr::UnOp(UnOp::Not, ref vv) = &*v {
            vv.clone()
        } else if let Expr::BinRel(rel, ref l, ref r) = &*v {
            Self::lift_binrel(rel.inverse(), l.clone(), r.clone())
        } else if v.is_top() {
            Self::top(v.bits())
        } else {
            Self::lift_unop(UnOp::Not, v)
        }
    }

    pub fn add(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.add(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        let (l, r) = Self::sort_comm(l, r);
        if r.is_zero() {
            return l;
        }
        if let Expr::Val(ref rv) = &*r {
            if let Expr::BinOp(BinOp::Add, ref x, ref c) = &*l {
                if let Expr::Val(ref cv) = &**c {
                    return Self::add(x.clone(), Self::val(cv.add(rv)));
                }
            }
        }
        Self::lift_binop(BinOp::Add, l, r)
    }

    pub fn sub(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.sub(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if l == r {
            return Self::cst(0, l.bits());
        }
        if let Expr::Val(ref rv) = &*r {
            // x - c normalizes to x + (-c) so constant chains keep folding
            return Self::add(l, Self::val(rv.neg()));
        }
        if r.is_zero() {
            return l;
        }
        if l.is_zero() {
            return Self::neg(r);
        }
        Self::lift_binop(BinOp::Sub, l, r)
    }

    pub fn mul(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.mul(rv));
        }
        if l.is_zero() || r.is_zero() {
            return Self::cst(0, l.bits());
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        let (l, r) = Self::sort_comm(l, r);
        if r.is_one() {
            return l;
        }
        if let Expr::Val(ref rv) = &*r {
            if let Expr::BinOp(BinOp::Mul, ref x, ref c) = &*l {
                if let Expr::Val(ref cv) = &**c {
                    return Self::mul(x.clone(), Self::val(cv.mul(rv)));
                }
            }
        }
        Self::lift_binop(BinOp::Mul, l, r)
    }

    pub fn div(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if r.is_zero() {
            return Self::top(l.bits());
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.divu(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if l.is_zero() || r.is_one() {
            return l;
        }
        Self::lift_binop(BinOp::Div, l, r)
    }

    pub fn sdiv(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if r.is_zero() {
            return Self::top(l.bits());
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.divs(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if l.is_zero() || r.is_one() {
            return l;
        }
        Self::lift_binop(BinOp::Sdiv, l, r)
    }

    pub fn rem(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if r.is_zero() {
            return Self::top(l.bits());
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.remu(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        Self::lift_binop(BinOp::Rem, l, r)
    }

    pub fn srem(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if r.is_zero() {
            return Self::top(l.bits());
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.rems(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        Self::lift_binop(BinOp::Srem, l, r)
    }

    pub fn and(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if l.is_zero() || r.is_ones() {
            return l;
        }
        if r.is_zero() || l.is_ones() {
            return r;
        }
        if l == r {
            return l;
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.and(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        let (l, r) = Self::sort_comm(l, r);
        if let Expr::Val(ref rv) = &*r {
            if let Expr::BinOp(BinOp::And, ref x, ref c) = &*l {
                if let Expr::Val(ref cv) = &**c {
                    return Self::and(x.clone(), Self::val(cv.and(rv)));
                }
            }
        }
        Self::lift_binop(BinOp::And, l, r)
    }

    pub fn or(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if l.is_zero() || r.is_ones() {
            return r;
        }
        if r.is_zero() || l.is_ones() {
            return l;
        }
        if l == r {
            return l;
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.or(rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        let (l, r) = Self::sort_comm(l, r);
        if let Expr::Val(ref rv) = &*r {
            if let Expr::BinOp(BinOp::Or, ref x, ref c) = &*l {
                if let Expr::Val(ref cv) = &**c {
                    return Self::or(x.clone(), Self::val(cv.or(rv)));
                }
            }
        }
        Self::lift_binop(BinOp::Or, l, r)
    }

    pub fn xor(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if l == r {
            return Self::cst(0, l.bits());
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(lv.xor(rv));
        }
        if r.is_ones() {
            return Self::not(l);
        }
        if l.is_ones() {
            return Self::not(r);
        }
        if r.is_zero() {
            return l;
        }
        if l.is_zero() {
            return r;
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        let (l, r) = Self::sort_comm(l, r);
        if let Expr::Val(ref rv) = &*r {
            if let Expr::BinOp(BinOp::Xor, ref x, ref c) = &*l {
                if let Expr::Val(ref cv) = &**c {
                    return Self::xor(x.clone(), Self::val(cv.xor(rv)));
                }
            }
        }
        Self::lift_binop(BinOp::Xor, l, r)
    }

    fn shift_amount(r: &SymExpr) -> Option<u32> {
        match &**r {
            Expr::Val(c) => Some(c.value().min(u32::MAX as u128) as u32),
            _ => None,
        }
    }

    pub fn shl(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() || l.is_zero() {
            return l;
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if let Expr::Val(ref lv) = &*l {
            if let Some(n) = Self::shift_amount(&r) {
                return Self::val(lv.shl(n));
            }
        }
        Self::lift_binop(BinOp::Shl, l, r)
    }

    pub fn shr(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() || l.is_zero() {
            return l;
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if let Expr::Val(ref lv) = &*l {
            if let Some(n) = Self::shift_amount(&r) {
                return Self::val(lv.shr(n));
            }
        }
        Self::lift_binop(BinOp::Shr, l, r)
    }

    pub fn sar(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() || l.is_zero() {
            return l;
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if let Expr::Val(ref lv) = &*l {
            if let Some(n) = Self::shift_amount(&r) {
                return Self::val(lv.sar(n));
            }
        }
        Self::lift_binop(BinOp::Sar, l, r)
    }

    pub fn rol(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() {
            return l;
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if let Expr::Val(ref lv) = &*l {
            if let Some(n) = Self::shift_amount(&r) {
                return Self::val(lv.rol(n));
            }
        }
        Self::lift_binop(BinOp::Rol, l, r)
    }

    pub fn ror(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() {
            return l;
        }
        if l.is_top() || r.is_top() {
            return Self::top(l.bits());
        }
        if let Expr::Val(ref lv) = &*l {
            if let Some(n) = Self::shift_amount(&r) {
                return Self::val(lv.ror(n));
            }
        }
        Self::lift_binop(BinOp::Ror, l, r)
    }

    pub fn binrel(op: BinRel, l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());
        if l == r {
            return Self::val(op.on_equal());
        }
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            return Self::val(op.eval_cst(lv, rv));
        }
        if l.is_top() || r.is_top() {
            return Self::top(1);
        }
        // comparing a single bit against a literal is the bit itself
        if l.bits() == 1 && matches!(op, BinRel::Eq | BinRel::Ne) {
            if let Expr::Val(ref rv) = &*r {
                let same = rv.is_one() == (op == BinRel::Eq);
                return if same { l } else { Self::not(l) };
            }
            if let Expr::Val(ref lv) = &*l {
                let same = lv.is_one() == (op == BinRel::Eq);
                return if same { r } else { Self::not(r) };
            }
        }
        Self::lift_binrel(op, l, r)
    }

    pub fn eq(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Eq, self, r)
    }

    pub fn ne(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Ne, self, r)
    }

    pub fn ltu(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Ltu, self, r)
    }

    pub fn lts(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Lts, self, r)
    }

    pub fn leu(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Leu, self, r)
    }

    pub fn les(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Les, self, r)
    }

    pub fn gtu(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Gtu, self, r)
    }

    pub fn gts(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Gts, self, r)
    }

    pub fn geu(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Geu, self, r)
    }

    pub fn ges(self, r: SymExpr) -> SymExpr {
        Self::binrel(BinRel::Ges, self, r)
    }

    pub fn binary(op: BinOp, l: SymExpr, r: SymExpr) -> SymExpr {
        match op {
            BinOp::Add => Self::add(l, r),
            BinOp::Sub => Self::sub(l, r),
            BinOp::Mul => Self::mul(l, r),
            BinOp::Div => Self::div(l, r),
            BinOp::Sdiv => Self::sdiv(l, r),
            BinOp::Rem => Self::rem(l, r),
            BinOp::Srem => Self::srem(l, r),
            BinOp::And => Self::and(l, r),
            BinOp::Or => Self::or(l, r),
            BinOp::Xor => Self::xor(l, r),
            BinOp::Shl => Self::shl(l, r),
            BinOp::Shr => Self::shr(l, r),
            BinOp::Sar => Self::sar(l, r),
            BinOp::Rol => Self::rol(l, r),
            BinOp::Ror => Self::ror(l, r),
        }
    }

    pub fn unary(op: UnOp, v: SymExpr) -> SymExpr {
        match op {
            UnOp::Neg => Self::neg(v),
            UnOp::Not => Self::not(v),
        }
    }

    /// Bit slice [lo..hi) of `self`.
    pub fn extract(self, lo: u32, hi: u32) -> SymExpr {
        assert!(lo < hi && hi <= self.bits());
        if lo == 0 && hi == self.bits() {
            return self;
        }
        match &*self {
            Expr::Val(c) => Self::cst(c.value() >> lo, hi - lo),
            Expr::Top(_) => Self::top(hi - lo),
            Expr::Extract(e, l0, _) => e.clone().extract(l0 + lo, l0 + hi),
            Expr::Compose(parts) => {
                let mut out = Vec::new();
                let mut off = 0u32;
                for p in parts.iter() {
                    let (s, e) = (off, off + p.bits());
                    off = e;
                    if e <= lo || s >= hi {
                        continue;
                    }
                    out.push(p.clone().extract(lo.max(s) - s, hi.min(e) - s));
                }
                Self::compose(out)
            }
            Expr::Mem(p, _, Endian::Little) if lo % 8 == 0 && hi % 8 == 0 => {
                Self::mem(p.offset(lo as i64 / 8), hi - lo, Endian::Little)
            }
            Expr::UnOp(UnOp::Not, e) => Self::not(e.clone().extract(lo, hi)),
            Expr::BinOp(op @ (BinOp::And | BinOp::Or | BinOp::Xor), l, r) => {
                Self::binary(*op, l.clone().extract(lo, hi), r.clone().extract(lo, hi))
            }
            _ => EXPR.mk(Expr::Extract(self, lo, hi)).into(),
        }
    }

    /// LSB-first concatenation. Adjacent constants, Tops and contiguous
    /// slices of one base coalesce; a partition of `e` recomposes to `e`.
    pub fn compose<I: IntoIterator<Item = SymExpr>>(parts: I) -> SymExpr {
        use itertools::Itertools;

        let flat = parts.into_iter().flat_map(|p| match &*p {
            Expr::Compose(inner) => inner.iter().cloned().collect::<Vec<_>>(),
            _ => vec![p],
        });
        let mut merged: Vec<SymExpr> = flat.coalesce(Self::merge_parts).collect();
        assert!(!merged.is_empty());
        if merged.len() == 1 {
            return merged.swap_remove(0);
        }
        EXPR.mk(Expr::Compose(SmallVec::from_vec(merged))).into()
    }

    fn merge_parts(lo: SymExpr, hi: SymExpr) -> Result<SymExpr, (SymExpr, SymExpr)> {
        match (&*lo, &*hi) {
            (Expr::Val(a), Expr::Val(b)) if a.size() + b.size() <= 128 => Ok(Self::cst(
                b.value() << a.size() | a.value(),
                a.size() + b.size(),
            )),
            (Expr::Top(a), Expr::Top(b)) => Ok(Self::top(a + b)),
            (Expr::Extract(x, l0, h0), Expr::Extract(y, l1, h1)) if x == y && h0 == l1 => {
                Ok(x.clone().extract(*l0, *h1))
            }
            _ => Err((lo, hi)),
        }
    }

    pub fn ite(self, t: SymExpr, f: SymExpr) -> SymExpr {
        assert_eq!(self.bits(), 1);
        assert_eq!(t.bits(), f.bits());
        if let Expr::Val(ref c) = &*self {
            return if c.is_zero() { f } else { t };
        }
        if self.is_top() {
            return Self::top(t.bits());
        }
        if t == f {
            return t;
        }
        EXPR.mk(Expr::Tst(self, t, f)).into()
    }

    pub fn bits(&self) -> u32 {
        match &**self {
            Expr::Val(ref c) => c.size(),
            Expr::Reg(ref r) => r.size(),
            Expr::Ext(ref x) => x.size(),
            Expr::Top(sz) => *sz,
            Expr::UnOp(_, ref v) | Expr::BinOp(_, ref v, _) => v.bits(),
            Expr::BinRel(_, _, _) => 1,
            Expr::Extract(_, lo, hi) => hi - lo,
            Expr::Compose(ref parts) => parts.iter().map(|p| p.bits()).sum(),
            Expr::Tst(_, ref t, _) => t.bits(),
            Expr::Mem(_, sz, _) => *sz,
        }
    }

    pub fn is_val(&self) -> bool {
        matches!(&**self, Expr::Val(_))
    }

    pub fn as_val(&self) -> Option<&Const> {
        match &**self {
            Expr::Val(ref c) => Some(c),
            _ => None,
        }
    }

    pub fn is_reg(&self) -> bool {
        matches!(&**self, Expr::Reg(_))
    }

    pub fn as_reg(&self) -> Option<&Reg> {
        match &**self {
            Expr::Reg(ref r) => Some(r),
            _ => None,
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(&**self, Expr::Ext(_))
    }

    pub fn is_mem(&self) -> bool {
        matches!(&**self, Expr::Mem(_, _, _))
    }

    pub fn is_top(&self) -> bool {
        matches!(&**self, Expr::Top(_))
    }

    pub fn is_zero(&self) -> bool {
        matches!(&**self, Expr::Val(ref c) if c.is_zero())
    }

    pub fn is_one(&self) -> bool {
        matches!(&**self, Expr::Val(ref c) if c.is_one())
    }

    pub fn is_ones(&self) -> bool {
        matches!(&**self, Expr::Val(ref c) if c.is_ones())
    }

    pub fn is_signed(&self) -> bool {
        match &**self {
            Expr::Val(ref c) => c.is_signed(),
            Expr::BinOp(BinOp::Sdiv | BinOp::Srem | BinOp::Sar, _, _)
            | Expr::UnOp(UnOp::Neg, _) => true,
            _ => false,
        }
    }

    /// Splits `base + disp` into its symbolic base and concrete offset.
    pub fn unoffset(&self) -> (SymExpr, i64) {
        if let Expr::BinOp(BinOp::Add, ref x, ref c) = &**self {
            if let Expr::Val(ref cv) = &**c {
                return (x.clone(), cv.int() as i64);
            }
        }
        (self.clone(), 0)
    }

    /// Registers referenced anywhere in the tree.
    pub fn regs(&self) -> Vec<Reg> {
        struct Collect(Vec<Reg>);
        impl<'e> VisitRef<'e> for Collect {
            fn visit_val_ref(&mut self, _: &'e Const) {}
            fn visit_ext_ref(&mut self, _: &'e Ext) {}
            fn visit_top_ref(&mut self, _: u32) {}
            fn visit_reg_ref(&mut self, reg: &'e Reg) {
                if !self.0.contains(reg) {
                    self.0.push(reg.clone());
                }
            }
        }
        let mut c = Collect(Vec::new());
        c.visit_expr_ref(self);
        c.0
    }

    pub fn simplify(self) -> SymExpr {
        // default: rebuild + apply simplifications in ctors
        struct Simplify;
        impl<'expr> VisitMap<'expr> for Simplify {}

        Simplify.visit_expr(&self)
    }
}

impl Add for &'_ SymExpr {
    type Output = SymExpr;

    fn add(self, rhs: Self) -> Self::Output {
        SymExpr::add(self.clone(), rhs.clone())
    }
}

impl Add for SymExpr {
    type Output = SymExpr;

    fn add(self, rhs: Self) -> Self::Output {
        SymExpr::add(self, rhs)
    }
}

impl Sub for &'_ SymExpr {
    type Output = SymExpr;

    fn sub(self, rhs: &SymExpr) -> Self::Output {
        SymExpr::sub(self.clone(), rhs.clone())
    }
}

impl Sub for SymExpr {
    type Output = SymExpr;

    fn sub(self, rhs: Self) -> Self::Output {
        SymExpr::sub(self, rhs)
    }
}

impl Mul for &'_ SymExpr {
    type Output = SymExpr;

    fn mul(self, rhs: Self) -> Self::Output {
        SymExpr::mul(self.clone(), rhs.clone())
    }
}

impl Mul for SymExpr {
    type Output = SymExpr;

    fn mul(self, rhs: Self) -> Self::Output {
        SymExpr::mul(self, rhs)
    }
}

impl Div for &'_ SymExpr {
    type Output = SymExpr;

    fn div(self, rhs: Self) -> Self::Output {
        if self.is_signed() || rhs.is_signed() {
            SymExpr::sdiv(self.clone(), rhs.clone())
        } else {
            SymExpr::div(self.clone(), rhs.clone())
        }
    }
}

impl Div for SymExpr {
    type Output = SymExpr;

    fn div(self, rhs: Self) -> Self::Output {
        if self.is_signed() || rhs.is_signed() {
            SymExpr::sdiv(self, rhs)
        } else {
            SymExpr::div(self, rhs)
        }
    }
}

impl Rem for &'_ SymExpr {
    type Output = SymExpr;

    fn rem(self, rhs: Self) -> Self::Output {
        if self.is_signed() || rhs.is_signed() {
            SymExpr::srem(self.clone(), rhs.clone())
        } else {
            SymExpr::rem(self.clone(), rhs.clone())
        }
    }
}

impl Rem for SymExpr {
    type Output = SymExpr;

    fn rem(self, rhs: Self) -> Self::Output {
        if self.is_signed() || rhs.is_signed() {
            SymExpr::srem(self, rhs)
        } else {
            SymExpr::rem(self, rhs)
        }
    }
}

impl BitAnd for &'_ SymExpr {
    type Output = SymExpr;

    fn bitand(self, rhs: Self) -> Self::Output {
        SymExpr::and(self.clone(), rhs.clone())
    }
}

impl BitAnd for SymExpr {
    type Output = SymExpr;

    fn bitand(self, rhs: Self) -> Self::Output {
        SymExpr::and(self, rhs)
    }
}

impl BitOr for &'_ SymExpr {
    type Output = SymExpr;

    fn bitor(self, rhs: Self) -> Self::Output {
        SymExpr::or(self.clone(), rhs.clone())
    }
}

impl BitOr for SymExpr {
    type Output = SymExpr;

    fn bitor(self, rhs: Self) -> Self::Output {
        SymExpr::or(self, rhs)
    }
}

impl BitXor for &'_ SymExpr {
    type Output = SymExpr;

    fn bitxor(self, rhs: Self) -> Self::Output {
        SymExpr::xor(self.clone(), rhs.clone())
    }
}

impl BitXor for SymExpr {
    type Output = SymExpr;

    fn bitxor(self, rhs: Self) -> Self::Output {
        SymExpr::xor(self, rhs)
    }
}

impl Shl for &'_ SymExpr {
    type Output = SymExpr;

    fn shl(self, rhs: Self) -> Self::Output {
        SymExpr::shl(self.clone(), rhs.clone())
    }
}

impl Shl for SymExpr {
    type Output = SymExpr;

    fn shl(self, rhs: Self) -> Self::Output {
        SymExpr::shl(self, rhs)
    }
}

impl Shr for &'_ SymExpr {
    type Output = SymExpr;

    fn shr(self, rhs: Self) -> Self::Output {
        if self.is_signed() {
            SymExpr::sar(self.clone(), rhs.clone())
        } else {
            SymExpr::shr(self.clone(), rhs.clone())
        }
    }
}

impl Shr for SymExpr {
    type Output = SymExpr;

    fn shr(self, rhs: Self) -> Self::Output {
        if self.is_signed() {
            SymExpr::sar(self, rhs)
        } else {
            SymExpr::shr(self, rhs)
        }
    }
}

impl Neg for &'_ SymExpr {
    type Output = SymExpr;

    fn neg(self) -> Self::Output {
        SymExpr::neg(self.clone())
    }
}

impl Neg for SymExpr {
    type Output = SymExpr;

    fn neg(self) -> Self::Output {
        SymExpr::neg(self)
    }
}

impl Not for &'_ SymExpr {
    type Output = SymExpr;

    fn not(self) -> Self::Output {
        SymExpr::not(self.clone())
    }
}

impl Not for SymExpr {
    type Output = SymExpr;

    fn not(self) -> Self::Output {
        SymExpr::not(self)
    }
}

pub trait VisitRef<'expr> {
    fn visit_val_ref(&mut self, cst: &'expr Const);
    fn visit_reg_ref(&mut self, reg: &'expr Reg);
    fn visit_ext_ref(&mut self, ext: &'expr Ext);
    fn visit_top_ref(&mut self, bits: u32);

    #[allow(unused_variables)]
    fn visit_unop_ref(&mut self, op: UnOp, expr: &'expr SymExpr) {
        self.visit_expr_ref(expr);
    }

    #[allow(unused_variables)]
    fn visit_binop_ref(&mut self, op: BinOp, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) {
        self.visit_expr_ref(lexpr);
        self.visit_expr_ref(rexpr);
    }

    #[allow(unused_variables)]
    fn visit_binrel_ref(&mut self, op: BinRel, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) {
        self.visit_expr_ref(lexpr);
        self.visit_expr_ref(rexpr);
    }

    #[allow(unused_variables)]
    fn visit_extract_ref(&mut self, expr: &'expr SymExpr, lo: u32, hi: u32) {
        self.visit_expr_ref(expr);
    }

    fn visit_compose_ref(&mut self, parts: &'expr [SymExpr]) {
        for part in parts {
            self.visit_expr_ref(part);
        }
    }

    fn visit_ite_ref(
        &mut self,
        cond: &'expr SymExpr,
        lexpr: &'expr SymExpr,
        rexpr: &'expr SymExpr,
    ) {
        self.visit_expr_ref(cond);
        self.visit_expr_ref(lexpr);
        self.visit_expr_ref(rexpr);
    }

    #[allow(unused_variables)]
    fn visit_mem_ref(&mut self, ptr: &'expr Ptr, bits: u32, endian: Endian) {
        self.visit_expr_ref(ptr.base());
    }

    fn visit_expr_ref(&mut self, expr: &'expr SymExpr) {
        match **expr {
            Expr::Val(ref c) => self.visit_val_ref(c),
            Expr::Reg(ref r) => self.visit_reg_ref(r),
            Expr::Ext(ref x) => self.visit_ext_ref(x),
            Expr::Top(bits) => self.visit_top_ref(bits),
            Expr::UnOp(op, ref e) => self.visit_unop_ref(op, e),
            Expr::BinOp(op, ref l, ref r) => self.visit_binop_ref(op, l, r),
            Expr::BinRel(op, ref l, ref r) => self.visit_binrel_ref(op, l, r),
            Expr::Extract(ref e, lo, hi) => self.visit_extract_ref(e, lo, hi),
            Expr::Compose(ref parts) => self.visit_compose_ref(parts),
            Expr::Tst(ref c, ref l, ref r) => self.visit_ite_ref(c, l, r),
            Expr::Mem(ref p, bits, endian) => self.visit_mem_ref(p, bits, endian),
        }
    }
}

pub trait VisitMap<'expr> {
    fn visit_val(&mut self, cst: &'expr Const) -> SymExpr {
        EXPR.mk(Expr::Val(cst.clone())).into()
    }

    fn visit_reg(&mut self, reg: &'expr Reg) -> SymExpr {
        EXPR.mk(Expr::Reg(reg.clone())).into()
    }

    fn visit_ext(&mut self, ext: &'expr Ext) -> SymExpr {
        EXPR.mk(Expr::Ext(ext.clone())).into()
    }

    fn visit_top(&mut self, bits: u32) -> SymExpr {
        SymExpr::top(bits)
    }

    fn visit_unop(&mut self, op: UnOp, expr: &'expr SymExpr) -> SymExpr {
        SymExpr::unary(op, self.visit_expr(expr))
    }

    fn visit_binop(&mut self, op: BinOp, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) -> SymExpr {
        SymExpr::binary(op, self.visit_expr(lexpr), self.visit_expr(rexpr))
    }

    fn visit_binrel(
        &mut self,
        op: BinRel,
        lexpr: &'expr SymExpr,
        rexpr: &'expr SymExpr,
    ) -> SymExpr {
        SymExpr::binrel(op, self.visit_expr(lexpr), self.visit_expr(rexpr))
    }

    fn visit_extract(&mut self, expr: &'expr SymExpr, lo: u32, hi: u32) -> SymExpr {
        self.visit_expr(expr).extract(lo, hi)
    }

    fn visit_compose(&mut self, parts: &'expr [SymExpr]) -> SymExpr {
        SymExpr::compose(parts.iter().map(|p| self.visit_expr(p)))
    }

    fn visit_ite(
        &mut self,
        cond: &'expr SymExpr,
        lexpr: &'expr SymExpr,
        rexpr: &'expr SymExpr,
    ) -> SymExpr {
        self.visit_expr(cond)
            .ite(self.visit_expr(lexpr), self.visit_expr(rexpr))
    }

    fn visit_mem(&mut self, ptr: &'expr Ptr, bits: u32, endian: Endian) -> SymExpr {
        SymExpr::mem(ptr.with_base(self.visit_expr(ptr.base())), bits, endian)
    }

    fn visit_expr(&mut self, expr: &'expr SymExpr) -> SymExpr {
        match &**expr {
            Expr::Val(c) => self.visit_val(c),
            Expr::Reg(r) => self.visit_reg(r),
            Expr::Ext(x) => self.visit_ext(x),
            Expr::Top(bits) => self.visit_top(*bits),
            Expr::UnOp(op, e) => self.visit_unop(*op, e),
            Expr::BinOp(op, l, r) => self.visit_binop(*op, l, r),
            Expr::BinRel(op, l, r) => self.visit_binrel(*op, l, r),
            Expr::Extract(e, lo, hi) => self.visit_extract(e, *lo, *hi),
            Expr::Compose(parts) => self.visit_compose(parts),
            Expr::Tst(c, l, r) => self.visit_ite(c, l, r),
            Expr::Mem(p, bits, endian) => self.visit_mem(p, *bits, *endian),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r32(name: &str) -> SymExpr {
        SymExpr::reg(Reg::new(name, 32))
    }

    #[test]
    fn constant_folding() {
        let e = (SymExpr::cst(3, 32) + SymExpr::cst(4, 32)) * SymExpr::cst(2, 32);
        assert_eq!(e, SymExpr::cst(14, 32));
        assert_eq!(e.bits(), 32);
    }

    #[test]
    fn identities() {
        let x = r32("x");
        assert_eq!(&x + &SymExpr::cst(0, 32), x);
        assert_eq!(&x * &SymExpr::cst(1, 32), x);
        assert_eq!(&x * &SymExpr::cst(0, 32), SymExpr::cst(0, 32));
        assert_eq!(&x & &SymExpr::cst(0, 32), SymExpr::cst(0, 32));
        assert_eq!(&x | &SymExpr::cst(0, 32), x);
        assert_eq!(&x ^ &x, SymExpr::cst(0, 32));
        assert_eq!(&x - &x, SymExpr::cst(0, 32));
        assert_eq!(-(-x.clone()), x);
        assert_eq!(!!x.clone(), x);
    }

    #[test]
    fn constant_chains_fold() {
        let x = r32("x");
        let e = (&x + &SymExpr::cst(1, 32)) + SymExpr::cst(2, 32);
        assert_eq!(e, &x + &SymExpr::cst(3, 32));
        let e = (&x - &SymExpr::cst(4, 32)) + SymExpr::cst(1, 32);
        assert_eq!(e, &x - &SymExpr::cst(3, 32));
    }

    #[test]
    fn commutative_normalization() {
        let x = r32("x");
        let y = r32("y");
        assert_eq!(&x + &y, &y + &x);
        assert_eq!(&x * &y, &y * &x);
        assert_eq!(&SymExpr::cst(5, 32) + &x, &x + &SymExpr::cst(5, 32));
    }

    #[test]
    fn comparisons_are_one_bit() {
        let x = r32("x");
        let y = r32("y");
        let e = x.clone().eq(y);
        assert_eq!(e.bits(), 1);
        assert_eq!(x.clone().eq(x.clone()), SymExpr::cst(1, 1));
        assert_eq!(x.clone().ne(x.clone()), SymExpr::cst(0, 1));
        assert_eq!(
            SymExpr::cst(3, 8).ltu(SymExpr::cst(7, 8)),
            SymExpr::cst(1, 1)
        );
        assert_eq!(
            SymExpr::cst(0xff, 8).lts(SymExpr::cst(0, 8)),
            SymExpr::cst(1, 1)
        );
    }

    #[test]
    fn not_of_relation_inverts() {
        let x = r32("x");
        let y = r32("y");
        let e = !x.clone().eq(y.clone());
        assert_eq!(e, x.ne(y));
    }

    #[test]
    fn extract_fuses_and_folds() {
        let x = r32("x");
        let inner = x.clone().extract(8, 24);
        assert_eq!(inner.bits(), 16);
        assert_eq!(inner.extract(4, 8), x.clone().extract(12, 16));
        assert_eq!(
            SymExpr::cst(0xdeadbeef, 32).extract(8, 16),
            SymExpr::cst(0xbe, 8)
        );
        assert_eq!(x.clone().extract(0, 32), x);
    }

    #[test]
    fn compose_partition_identity() {
        let x = r32("x");
        let parts = vec![
            x.clone().extract(0, 8),
            x.clone().extract(8, 20),
            x.clone().extract(20, 32),
        ];
        assert_eq!(SymExpr::compose(parts), x);
    }

    #[test]
    fn compose_merges_constants() {
        let e = SymExpr::compose(vec![SymExpr::cst(0xcd, 8), SymExpr::cst(0xab, 8)]);
        assert_eq!(e, SymExpr::cst(0xabcd, 16));
        let e = SymExpr::compose(vec![SymExpr::top(8), SymExpr::top(24)]);
        assert_eq!(e, SymExpr::top(32));
    }

    #[test]
    fn compose_keeps_symbolic_parts() {
        let x = r32("x");
        let e = SymExpr::compose(vec![SymExpr::cst(0xaa, 8), x.clone().extract(8, 32)]);
        assert_eq!(e.bits(), 32);
        assert!(matches!(&*e, Expr::Compose(parts) if parts.len() == 2));
        // reading the low byte back out lands on the constant part
        assert_eq!(e.extract(0, 8), SymExpr::cst(0xaa, 8));
    }

    #[test]
    fn tst_folds() {
        let x = r32("x");
        let y = r32("y");
        assert_eq!(SymExpr::cst(1, 1).ite(x.clone(), y.clone()), x);
        assert_eq!(SymExpr::cst(0, 1).ite(x.clone(), y.clone()), y);
        let sym = x.clone().eq(y.clone());
        assert_eq!(sym.ite(x.clone(), x.clone()), x);
    }

    #[test]
    fn top_absorbs() {
        let x = r32("x");
        assert!((x.clone() + SymExpr::top(32)).is_top());
        assert!((SymExpr::top(32) * x.clone()).is_top());
        // identity laws still win over Top absorption
        assert_eq!(SymExpr::top(32) & SymExpr::cst(0, 32), SymExpr::cst(0, 32));
    }

    #[test]
    fn division_by_zero_constant_is_unknown() {
        let x = r32("x");
        assert!(SymExpr::div(x, SymExpr::cst(0, 32)).is_top());
    }

    #[test]
    fn mem_slice_readdresses() {
        let base = r32("p");
        let m = SymExpr::mem(Ptr::new(base.clone(), 4), 32, Endian::Little);
        let lowhalf = m.extract(0, 16);
        match &*lowhalf {
            Expr::Mem(p, 16, Endian::Little) => {
                assert_eq!(p.base(), &base);
                assert_eq!(p.disp(), 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ptr_folds_constant_offsets() {
        let base = r32("p");
        let p = Ptr::new(&base + &SymExpr::cst(8, 32), 2);
        assert_eq!(p.base(), &base);
        assert_eq!(p.disp(), 10);
    }

    #[test]
    fn display_precedence() {
        let x = r32("x");
        let y = r32("y");
        let e = (&x + &y) * SymExpr::cst(2, 32);
        assert!(format!("{}", e).contains('('));
        let e2 = &x + &(&y * &SymExpr::cst(2, 32));
        assert!(!format!("{}", e2).contains('('));
    }

    #[test]
    fn serde_round_trip() {
        let x = r32("x");
        let e = (&x + &SymExpr::cst(4, 32)).extract(0, 16);
        let json = serde_json::to_string(&e).unwrap();
        let back: SymExpr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn regs_collects_leaves() {
        let x = r32("x");
        let y = r32("y");
        let e = (&x + &y) * x.clone();
        assert_eq!(e.regs().len(), 2);
    }

    #[test]
    fn simplify_is_stable() {
        let x = r32("x");
        let e = (&x + &SymExpr::cst(1, 32)) + SymExpr::cst(2, 32);
        assert_eq!(e.clone().simplify(), e);
    }
}
