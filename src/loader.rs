use std::sync::Arc;

use dyn_clone::{clone_trait_object, DynClone};
use either::Either;
use fnv::FnvHashMap;
use thiserror::Error;

use crate::bits::Endian;
use crate::disasm::Disassembler;
use crate::expr::{Expr, Ext, Reg, SymExpr};
use crate::insn::{Instruction, Semantics};
use crate::ispec::DecodeError;
use crate::mapper::{Mapper, MapperError};
use crate::mem::{Data, MemError};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Memory(#[from] MemError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Mapper(#[from] MapperError),
    #[error("code at {0:#x} is not concrete")]
    SymbolicCode(u64),
    #[error("container has no entry point")]
    NoEntry,
}

/// A loadable region as exposed by a program-format parser.
#[derive(Debug, Clone)]
pub struct Segment {
    vaddr: u64,
    data: Vec<u8>,
    name: Option<String>,
}

impl Segment {
    pub fn new(vaddr: u64, data: Vec<u8>) -> Segment {
        Segment {
            vaddr,
            data,
            name: None,
        }
    }

    pub fn named<S: Into<String>>(mut self, name: S) -> Segment {
        self.name = Some(name.into());
        self
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// The seam between program-format parsers and the executor.
pub trait Container {
    fn segments(&self) -> Vec<Segment>;

    /// Addresses of external symbols (import table slots).
    fn symbols(&self) -> Vec<(u64, String)> {
        Vec::new()
    }

    fn entry(&self) -> Option<u64>;
}

/// Replacement semantics for a call into an external symbol.
pub trait Stub: DynClone {
    fn call(&self, mapper: &mut Mapper, pc: &Reg) -> Result<(), MapperError>;
}

clone_trait_object!(Stub);

/// Fallback stub: drives PC to an unknown, ending the path.
#[derive(Debug, Clone, Default)]
pub struct DefaultStub;

impl Stub for DefaultStub {
    fn call(&self, mapper: &mut Mapper, pc: &Reg) -> Result<(), MapperError> {
        log::warn!("unstubbed external call, {} goes to top", pc.name());
        mapper.set_reg(pc.clone(), SymExpr::top(pc.size()))
    }
}

/// Architecture description: register file, decoder and semantics.
#[derive(Debug)]
pub struct Cpu {
    name: Arc<str>,
    registers: Vec<Reg>,
    pc: Reg,
    sp: Reg,
    disasm: Disassembler,
    semantics: Semantics,
    endian: Endian,
}

impl Cpu {
    pub fn new<S: AsRef<str>>(
        name: S,
        registers: Vec<Reg>,
        pc: Reg,
        sp: Reg,
        disasm: Disassembler,
        semantics: Semantics,
        endian: Endian,
    ) -> Cpu {
        Cpu {
            name: Arc::from(name.as_ref()),
            registers,
            pc,
            sp,
            disasm,
            semantics,
            endian,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registers(&self) -> &[Reg] {
        &self.registers
    }

    pub fn pc(&self) -> &Reg {
        &self.pc
    }

    pub fn sp(&self) -> &Reg {
        &self.sp
    }

    pub fn disasm(&self) -> &Disassembler {
        &self.disasm
    }

    pub fn semantics(&self) -> &Semantics {
        &self.semantics
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }
}

/// Executable program state: a container mapped into memory, a CPU, and
/// the evolving mapper. Decoding and stepping go through here.
#[derive(Clone)]
pub struct CoreExec<C: Container> {
    bin: C,
    cpu: Arc<Cpu>,
    stubs: FnvHashMap<Arc<str>, Box<dyn Stub>>,
    default_stub: Box<dyn Stub>,
    state: Mapper,
}

impl<C: Container> CoreExec<C> {
    /// Maps the container's segments, zeroes the general registers and
    /// binds PC to the entry point.
    pub fn new(bin: C, cpu: Arc<Cpu>) -> Result<CoreExec<C>, LoaderError> {
        let mut state = Mapper::new();
        for seg in bin.segments() {
            log::debug!(
                "mapping segment {} at {:#x} ({} bytes)",
                seg.name().unwrap_or("?"),
                seg.vaddr(),
                seg.data().len()
            );
            state
                .mem_mut()
                .write_at(seg.vaddr(), seg.data().to_vec(), cpu.endian());
        }
        for reg in cpu.registers() {
            if reg.is_general() {
                state.set_reg(reg.clone(), SymExpr::cst(0, reg.size()))?;
            }
        }
        let entry = bin.entry().ok_or(LoaderError::NoEntry)?;
        let pc = cpu.pc().clone();
        let width = pc.size();
        state.set_reg(pc, SymExpr::cst(entry as u128, width))?;
        Ok(CoreExec {
            bin,
            cpu,
            stubs: FnvHashMap::default(),
            default_stub: Box::new(DefaultStub),
            state,
        })
    }

    /// Carves out a zeroed stack of `size` bytes. With `randomize` the
    /// stack hangs off the symbolic stack pointer in its own zone;
    /// otherwise SP is pinned just under the top of the address space
    /// and the stack lives in the absolute zone.
    pub fn with_stack(mut self, size: usize, randomize: bool) -> Result<CoreExec<C>, LoaderError> {
        let sp = self.cpu.sp().clone();
        let width = sp.size();
        if randomize {
            let base =
                SymExpr::reg(sp) + SymExpr::cst_signed(-(size as i128), width);
            self.state
                .mem_mut()
                .write(&base, vec![0u8; size], self.cpu.endian())?;
        } else {
            let top = if width >= 64 {
                u64::MAX - 0xfff
            } else {
                (1u64 << width) - 0x1000
            };
            self.state.mem_mut().write_at(
                top - size as u64,
                vec![0u8; size],
                self.cpu.endian(),
            );
            self.state
                .set_reg(sp, SymExpr::cst(top as u128, width))?;
        }
        Ok(self)
    }

    pub fn container(&self) -> &C {
        &self.bin
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn state(&self) -> &Mapper {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut Mapper {
        &mut self.state
    }

    pub fn register_stub<S: AsRef<str>>(&mut self, name: S, stub: Box<dyn Stub>) {
        self.stubs.insert(Arc::from(name.as_ref()), stub);
    }

    pub fn set_default_stub(&mut self, stub: Box<dyn Stub>) {
        self.default_stub = stub;
    }

    // the 'static bound keeps clones of the stub independent of &self
    fn stub(&self, name: &str) -> &(dyn Stub + 'static) {
        match self.stubs.get(name) {
            Some(stub) => stub.as_ref(),
            None => self.default_stub.as_ref(),
        }
    }

    /// Plants an external-symbol expression at an import-table slot, so
    /// a jump through the slot lands on the external.
    pub fn stub_cell(&mut self, addr: u64, name: &str, bits: u32) {
        let ext = SymExpr::ext(Ext::new(name, bits));
        self.state
            .mem_mut()
            .write_at(addr, Data::Sym(ext), self.cpu.endian());
    }

    fn width(&self) -> u32 {
        self.cpu.pc().size()
    }

    /// Raw-or-symbolic chunks at a concrete address.
    pub fn read_data(
        &self,
        addr: u64,
        len: usize,
    ) -> Result<Vec<Either<Vec<u8>, SymExpr>>, LoaderError> {
        let address = SymExpr::cst(addr as u128, self.width());
        let chunks = self.state.mem().read(&address, len)?;
        Ok(chunks.into_iter().map(Either::from).collect())
    }

    /// Decodes the instruction at `addr`. A fetch window that runs off
    /// the mapped image is retried shorter; unrecognized bytes come back
    /// as `None`.
    pub fn read_instruction(
        &self,
        addr: u64,
        iset: usize,
    ) -> Result<Option<Instruction>, LoaderError> {
        let mut window = self.cpu.disasm().max_len();
        let address = SymExpr::cst(addr as u128, self.width());
        let chunks = loop {
            match self.state.mem().read(&address, window) {
                Ok(chunks) => break chunks,
                Err(MemError::Unmapped { address: gap, .. }) if gap > addr as i64 => {
                    window = (gap - addr as i64) as usize;
                }
                Err(err) => return Err(err.into()),
            }
        };
        let mut code = Vec::with_capacity(window);
        for chunk in chunks {
            match chunk {
                Data::Raw(bytes) => code.extend_from_slice(&bytes),
                Data::Sym(_) => break,
            }
        }
        if code.is_empty() {
            return Err(LoaderError::SymbolicCode(addr));
        }
        match self.cpu.disasm().disassemble(&code, iset, addr) {
            Ok(insn) => Ok(Some(insn)),
            Err(DecodeError::NoMatch)
            | Err(DecodeError::Mismatch)
            | Err(DecodeError::Short(_))
            | Err(DecodeError::Rejected(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Applies one instruction to the state, then dispatches to a stub
    /// if PC landed on an external symbol.
    pub fn execute(&mut self, insn: &Instruction) -> Result<(), LoaderError> {
        let mut step = Mapper::new();
        if let Err(err) = insn.run(&mut step, self.cpu.semantics()) {
            // a failed handler leaves the instruction's effects undefined;
            // drop the partial step and still move PC past the bytes
            log::warn!("semantics of {} failed: {}", insn, err);
            step = Mapper::new();
            let pc = SymExpr::reg(self.cpu.pc().clone());
            let next = &pc + &SymExpr::cst(insn.length() as u128, pc.bits());
            step.set(&pc, next)?;
        }
        self.state = self.state.then(&step)?;

        let pc = self.state.get_reg(self.cpu.pc());
        if let Expr::Ext(x) = &*pc {
            let name = x.name().to_owned();
            let pc_reg = self.cpu.pc().clone();
            let stub = dyn_clone::clone_box(self.stub(&name));
            stub.call(&mut self.state, &pc_reg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::InsnType;
    use crate::ispec::{Fields, ISpec, InstructionError};
    use crate::mem::MemoryMap;

    struct ToyBin {
        segments: Vec<Segment>,
        entry: Option<u64>,
    }

    impl Container for ToyBin {
        fn segments(&self) -> Vec<Segment> {
            self.segments.clone()
        }

        fn entry(&self) -> Option<u64> {
            self.entry
        }
    }

    fn pc() -> Reg {
        Reg::new("pc", 32).kind(crate::expr::RegKind::Pc)
    }

    fn sp() -> Reg {
        Reg::new("sp", 32).kind(crate::expr::RegKind::Stack)
    }

    fn step_hook(insn: &Instruction, m: &mut Mapper) -> Result<(), MapperError> {
        let pcx = SymExpr::reg(pc());
        let next = &pcx + &SymExpr::cst(insn.length() as u128, 32);
        m.set(&pcx, next)
    }

    fn jmpm_hook(insn: &Instruction, m: &mut Mapper) -> Result<(), MapperError> {
        m.set(&SymExpr::reg(pc()), insn.operands()[0].clone())
    }

    fn call_spec_hook(insn: &mut Instruction, fields: &Fields) -> Result<(), InstructionError> {
        let slot = fields.req("imm")?.as_int() as i64;
        insn.push_operand(SymExpr::mem(
            crate::expr::Ptr::new(SymExpr::cst(slot as u128, 32), 0),
            32,
            Endian::Little,
        ));
        Ok(())
    }

    fn nop_spec(_: &mut Instruction, _: &Fields) -> Result<(), InstructionError> {
        Ok(())
    }

    fn toy_cpu() -> Arc<Cpu> {
        let table = vec![
            Arc::new(
                ISpec::new("32<[ 0000 0010 imm(24) ]", nop_spec)
                    .unwrap()
                    .mnemonic("step"),
            ),
            Arc::new(
                ISpec::new("16<[ 0000 0011 imm(8) ]", |insn, fields| {
                    call_spec_hook(insn, fields)
                })
                .unwrap()
                .mnemonic("jmpm")
                .itype(InsnType::ControlFlow),
            ),
        ];
        let mut sem = Semantics::new("toy");
        sem.register("step", step_hook);
        sem.register("jmpm", jmpm_hook);
        let disasm = Disassembler::new(vec![table], Endian::Big);
        Arc::new(Cpu::new(
            "toy",
            vec![Reg::new("r0", 32), pc(), sp()],
            pc(),
            sp(),
            disasm,
            sem,
            Endian::Little,
        ))
    }

    #[test]
    fn pc_advances_by_instruction_length() {
        let bin = ToyBin {
            segments: vec![Segment::new(0x1004, vec![0x02, 0x00, 0x00, 0x00]).named(".text")],
            entry: Some(0x1004),
        };
        let mut core = CoreExec::new(bin, toy_cpu()).unwrap();

        let insn = core.read_instruction(0x1004, 0).unwrap().unwrap();
        assert_eq!(insn.mnemonic(), Some("step"));
        assert_eq!(insn.length(), 4);

        core.execute(&insn).unwrap();
        let pcv = core.state().get_reg(core.cpu().pc());
        assert_eq!(pcv, SymExpr::cst(0x1008, 32));
    }

    #[test]
    fn short_fetch_window_retries() {
        // two-byte image, decoder window is four bytes wide
        let bin = ToyBin {
            segments: vec![Segment::new(0x0, vec![0x03, 0x20])],
            entry: Some(0x0),
        };
        let core = CoreExec::new(bin, toy_cpu()).unwrap();
        let insn = core.read_instruction(0x0, 0).unwrap().unwrap();
        assert_eq!(insn.mnemonic(), Some("jmpm"));
        assert_eq!(insn.length(), 2);
    }

    #[test]
    fn unrecognized_bytes_are_none() {
        let bin = ToyBin {
            segments: vec![Segment::new(0x0, vec![0xff, 0xff, 0xff, 0xff])],
            entry: Some(0x0),
        };
        let core = CoreExec::new(bin, toy_cpu()).unwrap();
        assert!(core.read_instruction(0x0, 0).unwrap().is_none());
    }

    #[test]
    fn symbolic_code_is_an_error() {
        let bin = ToyBin {
            segments: vec![],
            entry: Some(0x0),
        };
        let mut core = CoreExec::new(bin, toy_cpu()).unwrap();
        core.stub_cell(0x0, "mystery", 32);
        assert!(matches!(
            core.read_instruction(0x0, 0),
            Err(LoaderError::SymbolicCode(0x0))
        ));
    }

    #[derive(Debug, Clone)]
    struct FixedStub(u64);

    impl Stub for FixedStub {
        fn call(&self, mapper: &mut Mapper, pc: &Reg) -> Result<(), MapperError> {
            mapper.set_reg(pc.clone(), SymExpr::cst(self.0 as u128, pc.size()))
        }
    }

    #[test]
    fn jump_through_import_slot_hits_the_stub() {
        // jmpm 0x20 reads the import slot at 0x20, which holds @puts
        let bin = ToyBin {
            segments: vec![Segment::new(0x100, vec![0x03, 0x20])],
            entry: Some(0x100),
        };
        let mut core = CoreExec::new(bin, toy_cpu()).unwrap();
        core.stub_cell(0x20, "puts", 32);
        core.register_stub("puts", Box::new(FixedStub(0x102)));

        let insn = core.read_instruction(0x100, 0).unwrap().unwrap();
        core.execute(&insn).unwrap();
        let pcv = core.state().get_reg(core.cpu().pc());
        assert_eq!(pcv, SymExpr::cst(0x102, 32));
    }

    #[test]
    fn unstubbed_import_goes_to_top() {
        let bin = ToyBin {
            segments: vec![Segment::new(0x100, vec![0x03, 0x20])],
            entry: Some(0x100),
        };
        let mut core = CoreExec::new(bin, toy_cpu()).unwrap();
        core.stub_cell(0x20, "gets", 32);

        let insn = core.read_instruction(0x100, 0).unwrap().unwrap();
        core.execute(&insn).unwrap();
        assert!(core.state().get_reg(core.cpu().pc()).is_top());
    }

    #[test]
    fn read_data_returns_chunks() {
        let bin = ToyBin {
            segments: vec![Segment::new(0x0, vec![0xde, 0xad])],
            entry: Some(0x0),
        };
        let mut core = CoreExec::new(bin, toy_cpu()).unwrap();
        core.stub_cell(0x2, "imp", 16);
        let chunks = core.read_data(0x0, 4).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().left().unwrap(), &vec![0xde, 0xad]);
        assert!(chunks[1].is_right());
    }

    #[test]
    fn stack_zone_is_separate() {
        let bin = ToyBin {
            segments: vec![Segment::new(0x0, vec![0x02, 0, 0, 0])],
            entry: Some(0x0),
        };
        let core = CoreExec::new(bin, toy_cpu())
            .unwrap()
            .with_stack(16, true)
            .unwrap();
        let sp = SymExpr::reg(sp());
        let slot = &sp + &SymExpr::cst_signed(-4, 32);
        let got = core.state().mem().read(&slot, 4).unwrap();
        assert_eq!(got[0].as_raw().unwrap(), &[0, 0, 0, 0]);
        // concrete zone unaffected
        assert!(MemoryMap::reference(&slot).unwrap().0.is_some());
    }

    #[test]
    fn fixed_stack_pins_sp() {
        let bin = ToyBin {
            segments: vec![Segment::new(0x0, vec![0x02, 0, 0, 0])],
            entry: Some(0x0),
        };
        let core = CoreExec::new(bin, toy_cpu())
            .unwrap()
            .with_stack(16, false)
            .unwrap();
        let spv = core.state().get_reg(core.cpu().sp());
        assert_eq!(spv, SymExpr::cst(0xffff_f000, 32));
        // the slot below SP folds to an absolute address
        let slot = &spv + &SymExpr::cst_signed(-4, 32);
        assert!(MemoryMap::reference(&slot).unwrap().0.is_none());
        let got = core.state().mem().read(&slot, 4).unwrap();
        assert_eq!(got[0].as_raw().unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn general_registers_start_zeroed() {
        let bin = ToyBin {
            segments: vec![Segment::new(0x1000, vec![0x02, 0, 0, 0])],
            entry: Some(0x1000),
        };
        let core = CoreExec::new(bin, toy_cpu()).unwrap();
        let r0 = SymExpr::reg(Reg::new("r0", 32));
        assert_eq!(core.state().eval(&r0), SymExpr::cst(0, 32));
        // PC holds the entry, SP stays symbolic
        assert_eq!(
            core.state().get_reg(core.cpu().pc()),
            SymExpr::cst(0x1000, 32)
        );
        assert_eq!(core.state().get_reg(core.cpu().sp()), SymExpr::reg(sp()));
    }

    #[test]
    fn failing_semantics_still_advance_pc() {
        fn broken(_: &Instruction, _: &mut Mapper) -> Result<(), MapperError> {
            Err(MapperError::Inconsistent)
        }
        let table = vec![Arc::new(
            ISpec::new("32<[ 0000 0010 imm(24) ]", nop_spec)
                .unwrap()
                .mnemonic("step"),
        )];
        let mut sem = Semantics::new("toy");
        sem.register("step", broken);
        let disasm = Disassembler::new(vec![table], Endian::Big);
        let cpu = Arc::new(Cpu::new(
            "toy",
            vec![pc(), sp()],
            pc(),
            sp(),
            disasm,
            sem,
            Endian::Little,
        ));
        let bin = ToyBin {
            segments: vec![Segment::new(0x0, vec![0x02, 0, 0, 0])],
            entry: Some(0x0),
        };
        let mut core = CoreExec::new(bin, cpu).unwrap();
        let insn = core.read_instruction(0x0, 0).unwrap().unwrap();
        core.execute(&insn).unwrap();
        assert_eq!(core.state().get_reg(core.cpu().pc()), SymExpr::cst(4, 32));
    }

    #[test]
    fn missing_entry_is_an_error() {
        let bin = ToyBin {
            segments: vec![],
            entry: None,
        };
        assert!(matches!(
            CoreExec::new(bin, toy_cpu()),
            Err(LoaderError::NoEntry)
        ));
    }
}
