use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;
use thiserror::Error;

use crate::bits::{Bits, Endian, RangeError};
use crate::insn::{InsnType, Instruction, MiscValue};

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("malformed pattern: {0}")]
    Format(String),
    #[error("pattern counts {counted} bits, {declared} declared")]
    Size { declared: usize, counted: usize },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("fixed bits mismatch")]
    Mismatch,
    #[error("{0} byte(s) short")]
    Short(usize),
    #[error("no pattern matched")]
    NoMatch,
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Rejected(#[from] InstructionError),
}

/// Raised by a pattern hook when a structurally matching encoding turns
/// out to be semantically invalid (reserved operands, bad combinations).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct InstructionError(String);

impl InstructionError {
    pub fn new<S: Into<String>>(msg: S) -> InstructionError {
        InstructionError(msg.into())
    }
}

/// Whether the pattern text lists the most or the least significant bit
/// first. Patterns default to MSB-first, matching how reference manuals
/// draw encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    MsbFirst,
    LsbFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proj {
    Uint,
    Raw,
    Str,
}

/// A named field bound to a bit position in the pattern window. A `len`
/// of `None` is the variable tail of a `*`-sized pattern.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: Arc<str>,
    pos: usize,
    len: Option<usize>,
    proj: Proj,
    attr: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Uint(u128, usize),
    Raw(Bits),
    Str(String),
}

impl FieldValue {
    pub fn len(&self) -> usize {
        match self {
            FieldValue::Uint(_, len) => *len,
            FieldValue::Raw(bits) => bits.len(),
            FieldValue::Str(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_int(&self) -> u128 {
        match self {
            FieldValue::Uint(v, _) => *v,
            FieldValue::Raw(bits) => bits.int(),
            // MSB-first character order
            FieldValue::Str(s) => s.chars().fold(0, |acc, c| acc << 1 | (c == '1') as u128),
        }
    }

    pub fn as_sint(&self) -> i128 {
        match self {
            FieldValue::Raw(bits) => bits.sint(),
            _ => Bits::new(self.as_int(), self.len()).sint(),
        }
    }

    pub fn as_bits(&self) -> Bits {
        match self {
            FieldValue::Raw(bits) => bits.clone(),
            _ => Bits::new(self.as_int(), self.len()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&FieldValue> for MiscValue {
    fn from(value: &FieldValue) -> MiscValue {
        match value {
            FieldValue::Uint(v, _) => MiscValue::Int(*v as i64),
            FieldValue::Raw(bits) => MiscValue::Int(bits.int() as i64),
            FieldValue::Str(s) => MiscValue::Str(s.clone()),
        }
    }
}

/// Field values extracted for one decoded instruction, handed to the
/// pattern hook.
#[derive(Debug, Clone, Default)]
pub struct Fields {
    map: FnvHashMap<Arc<str>, FieldValue>,
}

impl Fields {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.map.get(name)
    }

    pub fn req(&self, name: &str) -> Result<&FieldValue, InstructionError> {
        self.map
            .get(name)
            .ok_or_else(|| InstructionError::new(format!("missing field {}", name)))
    }
}

/// Finishes populating a matched instruction from its field values.
pub type SpecHook = fn(&mut Instruction, &Fields) -> Result<(), InstructionError>;

/// A compiled bit-pattern specification.
///
/// The format string is `N<[ ... ]`, `N>[ ... ]` or `*<[ ... ]` where `N`
/// is the bit width and `<`/`>` pick MSB-first or LSB-first listing. The
/// bracketed body mixes `0`, `1`, `-` (don't care), `{xx}` (hex byte) and
/// named fields `sym(len)`; field modifiers are `.` (instruction
/// attribute), `~` (raw bits), `#` (0/1 string) and `=` (the field
/// overlaps what follows instead of consuming bits). `sym(*)` is the
/// variable tail of a `*`-sized pattern, and a trailing `+` after the
/// bracket marks a prefix spec.
#[derive(Debug, Clone)]
pub struct ISpec {
    format: Arc<str>,
    size: Option<usize>,
    order: Order,
    pfx: bool,
    fix: Bits,
    mask: Bits,
    fields: Vec<FieldSpec>,
    mnemonic: Option<Arc<str>>,
    itype: InsnType,
    attrs: Vec<(Arc<str>, MiscValue)>,
    hook: SpecHook,
}

enum Directive {
    Bit(bool),
    DontCare,
    Byte(u8),
    Field {
        name: Arc<str>,
        len: Option<usize>,
        proj: Proj,
        attr: bool,
        reset: bool,
    },
}

impl Directive {
    /// Bits this directive consumes from the layout cursor.
    fn consumed(&self) -> Option<usize> {
        match self {
            Directive::Bit(_) | Directive::DontCare => Some(1),
            Directive::Byte(_) => Some(8),
            Directive::Field { reset: true, .. } => Some(0),
            Directive::Field { len, .. } => *len,
        }
    }
}

impl ISpec {
    pub fn new(format: &str, hook: SpecHook) -> Result<ISpec, SpecError> {
        let (size, order, pfx, directives) = parse_format(format)?;
        let counted: usize = directives.iter().filter_map(|d| d.consumed()).sum();
        let total = match size {
            Some(declared) => {
                if declared % 8 != 0 {
                    return Err(SpecError::Format(format!(
                        "size {} is not a whole number of bytes",
                        declared
                    )));
                }
                if counted != declared {
                    return Err(SpecError::Size {
                        declared,
                        counted,
                    });
                }
                declared
            }
            None => counted,
        };
        // a zero-width pattern would match without consuming anything
        if total == 0 {
            return Err(SpecError::Format("pattern has no bits".into()));
        }

        let mut fix = Bits::zero(total);
        let mut mask = Bits::zero(total);
        let mut fields = Vec::new();
        let mut seen_tail = false;

        // `<` lists MSB first, so walk the cursor down from the top;
        // `>` walks it up from bit 0.
        let mut cursor = match order {
            Order::MsbFirst => total,
            Order::LsbFirst => 0,
        };
        for d in directives {
            let span = match d.consumed() {
                Some(n) => n,
                None => {
                    // variable tail
                    if size.is_some() {
                        return Err(SpecError::Format(
                            "variable field in a sized pattern".into(),
                        ));
                    }
                    if seen_tail {
                        return Err(SpecError::Format("multiple variable fields".into()));
                    }
                    seen_tail = true;
                    if let Directive::Field {
                        name, proj, attr, ..
                    } = d
                    {
                        fields.push(FieldSpec {
                            name,
                            pos: 0,
                            len: None,
                            proj,
                            attr,
                        });
                    }
                    continue;
                }
            };
            let reset = matches!(d, Directive::Field { reset: true, .. });
            let dlen = if reset {
                match d {
                    Directive::Field { len: Some(l), .. } => l,
                    _ => {
                        return Err(SpecError::Format(
                            "variable field cannot reset the cursor".into(),
                        ))
                    }
                }
            } else {
                span
            };
            let pos = match order {
                Order::MsbFirst => cursor.checked_sub(dlen).ok_or_else(|| {
                    SpecError::Format("directive runs past the pattern start".into())
                })?,
                Order::LsbFirst => {
                    if cursor + dlen > total {
                        return Err(SpecError::Format(
                            "directive runs past the pattern end".into(),
                        ));
                    }
                    cursor
                }
            };
            if !reset {
                match order {
                    Order::MsbFirst => cursor -= dlen,
                    Order::LsbFirst => cursor += dlen,
                }
            }
            match d {
                Directive::Bit(b) => {
                    mask.set_bit(pos, true);
                    fix.set_bit(pos, b);
                }
                Directive::DontCare => {}
                Directive::Byte(v) => {
                    for i in 0..8 {
                        mask.set_bit(pos + i, true);
                        fix.set_bit(pos + i, v >> i & 1 == 1);
                    }
                }
                Directive::Field {
                    name, proj, attr, ..
                } => {
                    fields.push(FieldSpec {
                        name,
                        pos,
                        len: Some(dlen),
                        proj,
                        attr,
                    });
                }
            }
        }

        Ok(ISpec {
            format: Arc::from(format),
            size,
            order,
            pfx,
            fix,
            mask,
            fields,
            mnemonic: None,
            itype: InsnType::default(),
            attrs: Vec::new(),
            hook,
        })
    }

    pub fn mnemonic<S: AsRef<str>>(mut self, mnemonic: S) -> ISpec {
        self.mnemonic = Some(Arc::from(mnemonic.as_ref()));
        self
    }

    pub fn itype(mut self, itype: InsnType) -> ISpec {
        self.itype = itype;
        self
    }

    pub fn attr<S: AsRef<str>, V: Into<MiscValue>>(mut self, name: S, value: V) -> ISpec {
        self.attrs.push((Arc::from(name.as_ref()), value.into()));
        self
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// Declared bit width; `None` for variable-length patterns.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Smallest byte count a decode attempt needs.
    pub fn min_len(&self) -> usize {
        match self.size {
            Some(size) => size / 8,
            None => (self.mask.len() + 7) / 8,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn is_prefix(&self) -> bool {
        self.pfx
    }

    pub fn mask(&self) -> &Bits {
        &self.mask
    }

    pub fn fix(&self) -> &Bits {
        &self.fix
    }

    /// Matches `bytes` against the pattern and builds the instruction.
    /// Returns the instruction and the number of bytes consumed.
    pub fn decode(&self, bytes: &[u8], endian: Endian) -> Result<(Instruction, usize), DecodeError> {
        let fixed_bits = self.mask.len();
        let (consumed, buf) = match self.size {
            Some(size) => {
                let nbytes = size / 8;
                if bytes.len() < nbytes {
                    return Err(DecodeError::Short(nbytes - bytes.len()));
                }
                (nbytes, Bits::from_bytes(&bytes[..nbytes], endian))
            }
            None => {
                let need = (fixed_bits + 7) / 8;
                if bytes.len() < need {
                    return Err(DecodeError::Short(need - bytes.len()));
                }
                (bytes.len(), Bits::from_bytes(bytes, endian))
            }
        };
        // for variable MSB-first patterns the fixed window sits in the
        // high bits, above the tail
        let shift = match (self.size, self.order) {
            (None, Order::MsbFirst) => buf.len() - fixed_bits,
            _ => 0,
        };
        let window = buf.slice(shift, shift + fixed_bits)?;
        if !window.masked_eq(&self.mask, &self.fix) {
            return Err(DecodeError::Mismatch);
        }
        let tail = match (self.size, self.order) {
            (None, Order::MsbFirst) => Some(buf.slice(0, shift)?),
            (None, Order::LsbFirst) => Some(buf.slice(fixed_bits, buf.len())?),
            _ => None,
        };

        let mut insn = Instruction::new(&bytes[..consumed]);
        insn.set_format(self.format.clone());
        insn.set_itype(self.itype);
        if let Some(ref m) = self.mnemonic {
            insn.set_mnemonic(m.clone());
        }
        for (name, value) in &self.attrs {
            insn.set_misc(name.as_ref(), value.clone());
        }

        let mut fields = Fields::default();
        for f in &self.fields {
            let raw = match f.len {
                Some(len) => window.slice(f.pos, f.pos + len)?,
                None => tail.clone().unwrap_or_else(|| Bits::zero(0)),
            };
            let value = match f.proj {
                Proj::Uint => FieldValue::Uint(raw.int(), raw.len()),
                Proj::Raw => FieldValue::Raw(raw),
                Proj::Str => {
                    let s = match self.order {
                        Order::MsbFirst => raw.to_bin_string().chars().rev().collect(),
                        Order::LsbFirst => raw.to_bin_string(),
                    };
                    FieldValue::Str(s)
                }
            };
            if f.attr {
                insn.set_misc(f.name.as_ref(), MiscValue::from(&value));
            } else {
                fields.map.insert(f.name.clone(), value);
            }
        }

        (self.hook)(&mut insn, &fields)?;
        Ok((insn, consumed))
    }
}

impl fmt::Display for ISpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format)
    }
}

type ParsedFormat = (Option<usize>, Order, bool, Vec<Directive>);

fn parse_format(format: &str) -> Result<ParsedFormat, SpecError> {
    let (head, rest) = format
        .split_once('[')
        .ok_or_else(|| SpecError::Format("missing '['".into()))?;
    let (body, trailer) = rest
        .rsplit_once(']')
        .ok_or_else(|| SpecError::Format("missing ']'".into()))?;
    let pfx = match trailer.trim() {
        "" => false,
        "+" => true,
        other => {
            return Err(SpecError::Format(format!(
                "unexpected trailer {:?}",
                other
            )))
        }
    };

    let head = head.trim();
    let (sizestr, order) = if let Some(s) = head.strip_suffix('<') {
        (s, Order::MsbFirst)
    } else if let Some(s) = head.strip_suffix('>') {
        (s, Order::LsbFirst)
    } else {
        (head, Order::MsbFirst)
    };
    let size = match sizestr.trim() {
        "*" => None,
        s => Some(s.parse::<usize>().map_err(|_| {
            SpecError::Format(format!("bad size {:?}", s))
        })?),
    };

    let mut directives = Vec::new();
    let mut it = body.chars().peekable();
    while let Some(&c) = it.peek() {
        match c {
            c if c.is_whitespace() => {
                it.next();
            }
            '0' => {
                it.next();
                directives.push(Directive::Bit(false));
            }
            '1' => {
                it.next();
                directives.push(Directive::Bit(true));
            }
            '-' => {
                it.next();
                directives.push(Directive::DontCare);
            }
            '{' => {
                it.next();
                let mut hex = String::new();
                for ch in it.by_ref() {
                    if ch == '}' {
                        break;
                    }
                    hex.push(ch);
                }
                let v = u8::from_str_radix(hex.trim(), 16).map_err(|_| {
                    SpecError::Format(format!("bad byte literal {{{}}}", hex))
                })?;
                directives.push(Directive::Byte(v));
            }
            '.' | '~' | '#' | '=' | 'a'..='z' | 'A'..='Z' | '_' => {
                directives.push(parse_field(&mut it)?);
            }
            other => {
                return Err(SpecError::Format(format!(
                    "unknown directive {:?}",
                    other
                )))
            }
        }
    }
    Ok((size, order, pfx, directives))
}

fn parse_field(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Directive, SpecError> {
    let mut attr = false;
    let mut reset = false;
    let mut proj = Proj::Uint;
    while let Some(&c) = it.peek() {
        match c {
            '.' => attr = true,
            '~' => proj = Proj::Raw,
            '#' => proj = Proj::Str,
            '=' => reset = true,
            _ => break,
        }
        it.next();
    }
    let mut name = String::new();
    while let Some(&c) = it.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            it.next();
        } else {
            break;
        }
    }
    if name.is_empty() {
        return Err(SpecError::Format("field modifier without a name".into()));
    }
    let len = if it.peek() == Some(&'(') {
        it.next();
        let mut lenstr = String::new();
        for ch in it.by_ref() {
            if ch == ')' {
                break;
            }
            lenstr.push(ch);
        }
        match lenstr.trim() {
            "*" => None,
            s => Some(s.parse::<usize>().map_err(|_| {
                SpecError::Format(format!("bad field length {:?}", s))
            })?),
        }
    } else {
        Some(1)
    };
    Ok(Directive::Field {
        name: Arc::from(name.as_str()),
        len,
        proj,
        attr,
        reset,
    })
}
