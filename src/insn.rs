use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::expr::SymExpr;
use crate::ispec::ISpec;
use crate::mapper::{Mapper, MapperError};

/// Coarse classification used by block-level analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsnType {
    Unpredictable,
    Undefined,
    DataProcessing,
    ControlFlow,
    CpuState,
    System,
    Other,
}

impl InsnType {
    pub fn code(self) -> i8 {
        match self {
            InsnType::Unpredictable => -1,
            InsnType::Undefined => 0,
            InsnType::DataProcessing => 1,
            InsnType::ControlFlow => 2,
            InsnType::CpuState => 3,
            InsnType::System => 4,
            InsnType::Other => 5,
        }
    }
}

impl Default for InsnType {
    fn default() -> Self {
        InsnType::DataProcessing
    }
}

/// Architecture-specific side data attached to an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MiscValue {
    Flag(bool),
    Int(i64),
    Str(String),
    Expr(SymExpr),
}

impl From<bool> for MiscValue {
    fn from(v: bool) -> Self {
        MiscValue::Flag(v)
    }
}

impl From<i64> for MiscValue {
    fn from(v: i64) -> Self {
        MiscValue::Int(v)
    }
}

impl From<&str> for MiscValue {
    fn from(v: &str) -> Self {
        MiscValue::Str(v.to_owned())
    }
}

impl From<String> for MiscValue {
    fn from(v: String) -> Self {
        MiscValue::Str(v)
    }
}

impl From<SymExpr> for MiscValue {
    fn from(v: SymExpr) -> Self {
        MiscValue::Expr(v)
    }
}

/// A decoded instruction. The compiled pattern link is not serialized;
/// a deserialized instruction is re-attached with [`Instruction::rebind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    bytes: SmallVec<[u8; 8]>,
    mnemonic: Option<Arc<str>>,
    itype: InsnType,
    operands: Vec<SymExpr>,
    address: Option<u64>,
    format: Option<Arc<str>>,
    misc: FnvHashMap<String, MiscValue>,
    #[serde(skip)]
    spec: Option<Arc<ISpec>>,
}

impl Instruction {
    pub fn new(bytes: &[u8]) -> Instruction {
        Instruction {
            bytes: SmallVec::from_slice(bytes),
            mnemonic: None,
            itype: InsnType::default(),
            operands: Vec::new(),
            address: None,
            format: None,
            misc: FnvHashMap::default(),
            spec: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length in bytes.
    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    pub fn mnemonic(&self) -> Option<&str> {
        self.mnemonic.as_deref()
    }

    pub fn set_mnemonic(&mut self, mnemonic: Arc<str>) {
        self.mnemonic = Some(mnemonic);
    }

    pub fn itype(&self) -> InsnType {
        self.itype
    }

    pub fn set_itype(&mut self, itype: InsnType) {
        self.itype = itype;
    }

    pub fn operands(&self) -> &[SymExpr] {
        &self.operands
    }

    pub fn push_operand(&mut self, operand: SymExpr) {
        self.operands.push(operand);
    }

    pub fn address(&self) -> Option<u64> {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = Some(address);
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn set_format(&mut self, format: Arc<str>) {
        self.format = Some(format);
    }

    pub fn misc(&self, name: &str) -> Option<&MiscValue> {
        self.misc.get(name)
    }

    pub fn set_misc<V: Into<MiscValue>>(&mut self, name: &str, value: V) {
        self.misc.insert(name.to_owned(), value.into());
    }

    pub fn misc_flag(&self, name: &str) -> bool {
        matches!(self.misc.get(name), Some(MiscValue::Flag(true)))
    }

    pub fn spec(&self) -> Option<&Arc<ISpec>> {
        self.spec.as_ref()
    }

    pub fn set_spec(&mut self, spec: Arc<ISpec>) {
        self.spec = Some(spec);
    }

    /// Applies the registered semantics to `mapper`. An unregistered
    /// mnemonic is a warned no-op.
    pub fn run(&self, mapper: &mut Mapper, semantics: &Semantics) -> Result<(), MapperError> {
        let hook = self.mnemonic.as_deref().and_then(|m| semantics.get(m));
        match hook {
            Some(hook) => hook(self, mapper),
            None => {
                log::warn!(
                    "no semantics for {} in {}",
                    self.mnemonic.as_deref().unwrap_or("?"),
                    semantics.name()
                );
                Ok(())
            }
        }
    }

    /// Folds a decoded prefix into this instruction: the prefix bytes go
    /// in front, and its misc marks carry over where this instruction has
    /// none of its own.
    pub fn prepend_prefix(&mut self, prefix: &Instruction) {
        let mut bytes = SmallVec::from_slice(prefix.bytes());
        bytes.extend_from_slice(&self.bytes);
        self.bytes = bytes;
        for (k, v) in prefix.misc.iter() {
            self.misc.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Re-attaches the compiled pattern after deserialization, matching
    /// by format string.
    pub fn rebind(&mut self, table: &[Arc<ISpec>]) -> bool {
        let format = match self.format.as_deref() {
            Some(f) => f,
            None => return false,
        };
        match table.iter().find(|s| s.format() == format) {
            Some(spec) => {
                self.spec = Some(spec.clone());
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic.as_deref().unwrap_or("(bad)"))?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", op)?;
            } else {
                write!(f, ", {}", op)?;
            }
        }
        Ok(())
    }
}

pub type SemHook = fn(&Instruction, &mut Mapper) -> Result<(), MapperError>;

/// Per-ISA registry of semantic handlers, keyed by exact mnemonic.
#[derive(Debug, Clone)]
pub struct Semantics {
    name: Arc<str>,
    map: FnvHashMap<Arc<str>, SemHook>,
}

impl Semantics {
    pub fn new<S: AsRef<str>>(name: S) -> Semantics {
        Semantics {
            name: Arc::from(name.as_ref()),
            map: FnvHashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register<S: AsRef<str>>(&mut self, mnemonic: S, hook: SemHook) {
        self.map.insert(Arc::from(mnemonic.as_ref()), hook);
    }

    pub fn get(&self, mnemonic: &str) -> Option<SemHook> {
        self.map.get(mnemonic).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Reg;

    fn mov_hook(insn: &Instruction, m: &mut Mapper) -> Result<(), MapperError> {
        m.set(&insn.operands()[0], insn.operands()[1].clone())
    }

    #[test]
    fn run_dispatches_by_mnemonic() {
        let mut sem = Semantics::new("toy");
        sem.register("mov", mov_hook);

        let r0 = SymExpr::reg(Reg::new("r0", 32));
        let mut insn = Instruction::new(&[0x01, 0x02]);
        insn.set_mnemonic(Arc::from("mov"));
        insn.push_operand(r0.clone());
        insn.push_operand(SymExpr::cst(5, 32));

        let mut m = Mapper::new();
        insn.run(&mut m, &sem).unwrap();
        assert_eq!(m.eval(&r0), SymExpr::cst(5, 32));
    }

    #[test]
    fn missing_handler_is_a_noop() {
        let sem = Semantics::new("toy");
        let mut insn = Instruction::new(&[0x00]);
        insn.set_mnemonic(Arc::from("halt"));
        let mut m = Mapper::new();
        insn.run(&mut m, &sem).unwrap();
        assert!(m.bindings().is_empty());
    }

    #[test]
    fn prefix_merging() {
        let mut prefix = Instruction::new(&[0x66]);
        prefix.set_misc("opdsize", 16i64);
        prefix.set_misc("rep", true);

        let mut insn = Instruction::new(&[0x89, 0xc8]);
        insn.set_misc("rep", false);
        insn.prepend_prefix(&prefix);

        assert_eq!(insn.bytes(), &[0x66, 0x89, 0xc8]);
        assert_eq!(insn.length(), 3);
        assert_eq!(insn.misc("opdsize"), Some(&MiscValue::Int(16)));
        // the inner instruction's own marks win
        assert_eq!(insn.misc("rep"), Some(&MiscValue::Flag(false)));
    }

    #[test]
    fn type_codes_match_tags() {
        assert_eq!(InsnType::Unpredictable.code(), -1);
        assert_eq!(InsnType::Undefined.code(), 0);
        assert_eq!(InsnType::DataProcessing.code(), 1);
        assert_eq!(InsnType::ControlFlow.code(), 2);
        assert_eq!(InsnType::CpuState.code(), 3);
        assert_eq!(InsnType::System.code(), 4);
        assert_eq!(InsnType::Other.code(), 5);
        assert_eq!(InsnType::default(), InsnType::DataProcessing);
    }

    #[test]
    fn display_joins_operands() {
        let mut insn = Instruction::new(&[0x00]);
        insn.set_mnemonic(Arc::from("add"));
        insn.push_operand(SymExpr::reg(Reg::new("r0", 32)));
        insn.push_operand(SymExpr::cst(1, 32));
        assert_eq!(format!("{}", insn), "add r0, 0x1");
    }

    #[test]
    fn serde_round_trip_loses_only_the_spec_link() {
        let mut insn = Instruction::new(&[0xde, 0xad]);
        insn.set_mnemonic(Arc::from("mov"));
        insn.set_address(0x1000);
        insn.set_itype(InsnType::ControlFlow);
        insn.push_operand(SymExpr::reg(Reg::new("r1", 32)));
        insn.set_misc("cond", 14i64);

        let json = serde_json::to_string(&insn).unwrap();
        let back: Instruction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes(), insn.bytes());
        assert_eq!(back.mnemonic(), insn.mnemonic());
        assert_eq!(back.address(), insn.address());
        assert_eq!(back.itype(), insn.itype());
        assert_eq!(back.operands(), insn.operands());
        assert_eq!(back.misc("cond"), Some(&MiscValue::Int(14)));
        assert!(back.spec().is_none());
    }
}
