use std::fmt;

use fnv::FnvHashMap;
use thiserror::Error;

use crate::bits::Endian;
use crate::expr::{Expr, Ptr, Reg, SymExpr, VisitMap};
use crate::mem::{Data, MemError, MemoryMap, Part};

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("{0} is not an assignable location")]
    BadLocation(SymExpr),
    #[error("size mismatch: location holds {expected} bits, value has {found}")]
    SizeMismatch { expected: u32, found: u32 },
    #[error(transparent)]
    Memory(#[from] MemError),
    #[error("composed state is inconsistent")]
    Inconsistent,
}

/// An assignable location: a whole register, or a memory cell at an
/// evaluated pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Loc {
    Reg(Reg),
    Ptr(Ptr, u32, Endian),
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loc::Reg(r) => write!(f, "{}", r),
            Loc::Ptr(p, bits, _) => write!(f, "M{}({})", bits, p),
        }
    }
}

/// An ordered set of `location <- expression` bindings over an initial
/// state, plus a zoned memory image. Every stored expression is written
/// in terms of the state the mapper started from, so applying a mapper
/// is a parallel substitution.
#[derive(Debug, Clone, Default)]
pub struct Mapper {
    map: Vec<(Loc, SymExpr)>,
    index: FnvHashMap<Loc, usize>,
    mem: MemoryMap,
    conds: Vec<SymExpr>,
}

impl Mapper {
    pub fn new() -> Mapper {
        Mapper::default()
    }

    pub fn bindings(&self) -> &[(Loc, SymExpr)] {
        &self.map
    }

    pub fn conditions(&self) -> &[SymExpr] {
        &self.conds
    }

    pub fn mem(&self) -> &MemoryMap {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut MemoryMap {
        &mut self.mem
    }

    fn record(&mut self, loc: Loc, value: SymExpr) {
        if let Some(&i) = self.index.get(&loc) {
            self.map[i].1 = value;
        } else {
            self.index.insert(loc.clone(), self.map.len());
            self.map.push((loc, value));
        }
    }

    /// Current value of a register; unbound registers stand for their
    /// own initial value.
    pub fn get_reg(&self, reg: &Reg) -> SymExpr {
        match self.index.get(&Loc::Reg(reg.clone())) {
            Some(&i) => self.map[i].1.clone(),
            None => SymExpr::reg(reg.clone()),
        }
    }

    pub fn set_reg(&mut self, reg: Reg, value: SymExpr) -> Result<(), MapperError> {
        if reg.size() != value.bits() {
            return Err(MapperError::SizeMismatch {
                expected: reg.size(),
                found: value.bits(),
            });
        }
        self.record(Loc::Reg(reg), value);
        Ok(())
    }

    /// Reads `bits` of memory at an already-evaluated pointer. Unmapped
    /// spans stay symbolic as memory leaves over the same base.
    pub fn read_mem(&self, ptr: &Ptr, bits: u32, endian: Endian) -> Result<SymExpr, MapperError> {
        if bits % 8 != 0 {
            return Err(MemError::NotBytes(bits).into());
        }
        if let Expr::Ext(x) = &**ptr.base() {
            if ptr.disp() == 0 && x.size() == bits {
                return Ok(ptr.base().clone());
            }
        }
        let address = ptr_expr(ptr);
        let nbytes = bits as usize / 8;
        let mut parts = Vec::new();
        let mut cursor = 0i64;
        for part in self.mem.read_parts(&address, nbytes)? {
            match part {
                Part::Gap(n) => {
                    parts.push(SymExpr::mem(ptr.offset(cursor), n as u32 * 8, endian));
                    cursor += n as i64;
                }
                Part::Mapped(Data::Sym(expr)) => {
                    cursor += expr.bits() as i64 / 8;
                    parts.push(expr);
                }
                Part::Mapped(Data::Raw(bytes)) => {
                    // constants carry at most 128 bits each
                    for chunk in bytes.chunks(16) {
                        let mut val = 0u128;
                        match endian {
                            Endian::Little => {
                                for (i, b) in chunk.iter().enumerate() {
                                    val |= (*b as u128) << (i * 8);
                                }
                            }
                            Endian::Big => {
                                for b in chunk.iter() {
                                    val = val << 8 | *b as u128;
                                }
                            }
                        }
                        parts.push(SymExpr::cst(val, chunk.len() as u32 * 8));
                    }
                    cursor += bytes.len() as i64;
                }
            }
        }
        if endian == Endian::Big {
            // address order is MSB-first; compose wants LSB-first
            parts.reverse();
        }
        Ok(SymExpr::compose(parts))
    }

    pub fn set_mem(
        &mut self,
        ptr: &Ptr,
        bits: u32,
        endian: Endian,
        value: SymExpr,
    ) -> Result<(), MapperError> {
        if value.bits() != bits {
            return Err(MapperError::SizeMismatch {
                expected: bits,
                found: value.bits(),
            });
        }
        let address = ptr_expr(ptr);
        let data = match (&*value, endian) {
            (Expr::Val(c), _) if bits % 8 == 0 => {
                let mut bytes = Vec::with_capacity(bits as usize / 8);
                for i in 0..bits / 8 {
                    let shift = match endian {
                        Endian::Little => i * 8,
                        Endian::Big => bits - 8 - i * 8,
                    };
                    bytes.push((c.value() >> shift) as u8);
                }
                Data::Raw(bytes)
            }
            _ => Data::Sym(value.clone()),
        };
        self.mem.write(&address, data, endian)?;
        self.record(Loc::Ptr(ptr.clone(), bits, endian), value);
        Ok(())
    }

    /// Assigns `value` to a location expression: a register, a bit slice
    /// of a register, or a memory cell. Slices splice into the current
    /// register value; memory addresses are evaluated against the
    /// current state first.
    pub fn set(&mut self, loc: &SymExpr, value: SymExpr) -> Result<(), MapperError> {
        match &**loc {
            Expr::Reg(r) => self.set_reg(r.clone(), value),
            Expr::Extract(e, lo, hi) => {
                let reg = match e.as_reg() {
                    Some(r) => r.clone(),
                    None => return Err(MapperError::BadLocation(loc.clone())),
                };
                if value.bits() != hi - lo {
                    return Err(MapperError::SizeMismatch {
                        expected: hi - lo,
                        found: value.bits(),
                    });
                }
                let cur = self.get_reg(&reg);
                let size = reg.size();
                let mut parts = Vec::new();
                if *lo > 0 {
                    parts.push(cur.clone().extract(0, *lo));
                }
                parts.push(value);
                if *hi < size {
                    parts.push(cur.extract(*hi, size));
                }
                self.set_reg(reg, SymExpr::compose(parts))
            }
            Expr::Mem(p, bits, endian) => {
                let p = p.with_base(self.eval(p.base()));
                self.set_mem(&p, *bits, *endian, value)
            }
            _ => Err(MapperError::BadLocation(loc.clone())),
        }
    }

    /// Substitutes the mapper's bindings into `expr`. Memory reads that
    /// cannot be located collapse to unknowns.
    pub fn eval(&self, expr: &SymExpr) -> SymExpr {
        Evaluator { mapper: self }.visit_expr(expr)
    }

    /// Constrains the state with a 1-bit condition.
    pub fn assume(&mut self, cond: SymExpr) {
        assert_eq!(cond.bits(), 1);
        if !cond.is_one() {
            self.conds.push(cond);
        }
    }

    /// `self` applied after `first`: the bindings of `self`, with every
    /// right-hand side and address re-evaluated through `first`.
    pub fn rcompose(&self, first: &Mapper) -> Result<Mapper, MapperError> {
        let mut out = first.clone();
        for cond in &self.conds {
            let c = first.eval(cond);
            if c.is_zero() {
                return Err(MapperError::Inconsistent);
            }
            out.assume(c);
        }
        for (loc, value) in &self.map {
            let value = first.eval(value);
            match loc {
                Loc::Reg(r) => out.set_reg(r.clone(), value)?,
                Loc::Ptr(p, bits, endian) => {
                    let p = p.with_base(first.eval(p.base()));
                    out.set_mem(&p, *bits, *endian, value)?;
                }
            }
        }
        Ok(out)
    }

    /// Sequential composition: the state after running `self` then `next`.
    pub fn then(&self, next: &Mapper) -> Result<Mapper, MapperError> {
        next.rcompose(self)
    }

    /// Registers of the initial state this mapper depends on.
    pub fn inputs(&self) -> Vec<Reg> {
        let mut regs = Vec::new();
        let mut push = |found: Vec<Reg>| {
            for r in found {
                if !regs.contains(&r) {
                    regs.push(r);
                }
            }
        };
        for (loc, value) in &self.map {
            if let Loc::Ptr(p, _, _) = loc {
                push(p.base().regs());
            }
            push(value.regs());
        }
        for cond in &self.conds {
            push(cond.regs());
        }
        regs
    }
}

fn ptr_expr(ptr: &Ptr) -> SymExpr {
    let base = ptr.base().clone();
    if ptr.disp() == 0 {
        base
    } else {
        let bits = base.bits();
        base + SymExpr::cst_signed(ptr.disp() as i128, bits)
    }
}

struct Evaluator<'m> {
    mapper: &'m Mapper,
}

impl<'m, 'expr> VisitMap<'expr> for Evaluator<'m> {
    fn visit_reg(&mut self, reg: &'expr Reg) -> SymExpr {
        self.mapper.get_reg(reg)
    }

    fn visit_mem(&mut self, ptr: &'expr Ptr, bits: u32, endian: Endian) -> SymExpr {
        let ptr = ptr.with_base(self.visit_expr(ptr.base()));
        match self.mapper.read_mem(&ptr, bits, endian) {
            Ok(expr) => expr,
            Err(_) => SymExpr::top(bits),
        }
    }
}

impl fmt::Display for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cond in &self.conds {
            writeln!(f, "assume {}", cond)?;
        }
        for (loc, value) in &self.map {
            writeln!(f, "{} <- {}", loc, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r32(name: &str) -> Reg {
        Reg::new(name, 32)
    }

    #[test]
    fn unbound_register_is_itself() {
        let m = Mapper::new();
        let r0 = r32("r0");
        assert_eq!(m.get_reg(&r0), SymExpr::reg(r0));
    }

    #[test]
    fn register_assignment() {
        let mut m = Mapper::new();
        let r0 = r32("r0");
        m.set_reg(r0.clone(), SymExpr::cst(7, 32)).unwrap();
        assert_eq!(m.eval(&SymExpr::reg(r0)), SymExpr::cst(7, 32));
    }

    #[test]
    fn slice_assignment_splices() {
        let mut m = Mapper::new();
        let r0 = SymExpr::reg(r32("r0"));
        m.set(&r0.clone().extract(8, 16), SymExpr::cst(0xaa, 8))
            .unwrap();
        let v = m.eval(&r0);
        assert_eq!(v.bits(), 32);
        assert_eq!(v.clone().extract(8, 16), SymExpr::cst(0xaa, 8));
        assert_eq!(v.clone().extract(0, 8), r0.clone().extract(0, 8));
        assert_eq!(v.extract(16, 32), r0.extract(16, 32));
    }

    #[test]
    fn memory_write_then_read() {
        let mut m = Mapper::new();
        let r1 = SymExpr::reg(r32("r1"));
        let cell = SymExpr::mem(Ptr::new(r1.clone(), 0), 32, Endian::Little);
        m.set(&cell, SymExpr::cst(0xdeadbeef, 32)).unwrap();
        assert_eq!(m.eval(&cell), SymExpr::cst(0xdeadbeef, 32));
    }

    #[test]
    fn partial_memory_read_composes() {
        let mut m = Mapper::new();
        let r1 = SymExpr::reg(r32("r1"));
        let byte = SymExpr::mem(Ptr::new(r1.clone(), 0), 8, Endian::Little);
        m.set(&byte, SymExpr::cst(0xaa, 8)).unwrap();

        let word = SymExpr::mem(Ptr::new(r1.clone(), 0), 32, Endian::Little);
        let v = m.eval(&word);
        assert_eq!(v.bits(), 32);
        assert_eq!(v.clone().extract(0, 8), SymExpr::cst(0xaa, 8));
        // the unmapped remainder stays a memory leaf over the same base
        match &*v.extract(8, 32) {
            Expr::Mem(p, 24, Endian::Little) => {
                assert_eq!(p.base(), &r1);
                assert_eq!(p.disp(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn big_endian_memory_read() {
        let mut m = Mapper::new();
        let r1 = SymExpr::reg(r32("r1"));
        let word = SymExpr::mem(Ptr::new(r1.clone(), 0), 16, Endian::Big);
        m.set(&word, SymExpr::cst(0x1234, 16)).unwrap();
        assert_eq!(m.eval(&word), SymExpr::cst(0x1234, 16));
        let lowbyte = SymExpr::mem(Ptr::new(r1.clone(), 1), 8, Endian::Big);
        assert_eq!(m.eval(&lowbyte), SymExpr::cst(0x34, 8));
    }

    #[test]
    fn eval_is_idempotent() {
        let mut m = Mapper::new();
        let r0 = SymExpr::reg(r32("r0"));
        let r1 = SymExpr::reg(r32("r1"));
        m.set(&r0, &r1 + &SymExpr::cst(1, 32)).unwrap();
        let once = m.eval(&r0);
        assert_eq!(m.eval(&once), once);
    }

    #[test]
    fn composition_substitutes() {
        let r0 = SymExpr::reg(r32("r0"));
        let r1 = SymExpr::reg(r32("r1"));

        let mut m1 = Mapper::new();
        m1.set(&r0, &r0 + &SymExpr::cst(1, 32)).unwrap();

        let mut m2 = Mapper::new();
        m2.set(&r1, &r0 * &SymExpr::cst(2, 32)).unwrap();

        let m = m1.then(&m2).unwrap();
        assert_eq!(m.eval(&r0), &r0 + &SymExpr::cst(1, 32));
        assert_eq!(m.eval(&r1), (&r0 + &SymExpr::cst(1, 32)) * SymExpr::cst(2, 32));
    }

    #[test]
    fn composition_detects_contradiction() {
        let r0 = SymExpr::reg(r32("r0"));

        let mut m1 = Mapper::new();
        m1.set(&r0, SymExpr::cst(0, 32)).unwrap();

        let mut m2 = Mapper::new();
        m2.assume(r0.clone().eq(SymExpr::cst(1, 32)));

        assert!(matches!(m1.then(&m2), Err(MapperError::Inconsistent)));
    }

    #[test]
    fn bad_location_is_rejected() {
        let mut m = Mapper::new();
        let e = SymExpr::cst(1, 32) + SymExpr::reg(r32("r0"));
        assert!(matches!(
            m.set(&e, SymExpr::cst(0, 32)),
            Err(MapperError::BadLocation(_))
        ));
    }

    #[test]
    fn inputs_reference_initial_state() {
        let r0 = SymExpr::reg(r32("r0"));
        let r1 = SymExpr::reg(r32("r1"));
        let mut m = Mapper::new();
        m.set(&r0, &r1 + &SymExpr::cst(4, 32)).unwrap();
        let inputs = m.inputs();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].name(), "r1");
    }
}
