use std::fmt;

use either::Either;
use fnv::FnvHashMap;
use thiserror::Error;

use crate::bits::Endian;
use crate::expr::{Expr, SymExpr};

#[derive(Debug, Error)]
pub enum MemError {
    #[error("unmapped access at offset {address:#x}, {missing} byte(s) missing")]
    Unmapped { address: i64, missing: usize },
    #[error("cannot locate address {0}")]
    BadReference(SymExpr),
    #[error("{0}-bit symbolic value is not byte-sized")]
    NotBytes(u32),
}

/// Contents of a memory object: either concrete bytes or a symbolic
/// expression standing for `bits/8` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Raw(Vec<u8>),
    Sym(SymExpr),
}

impl Data {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Data::Raw(bytes) => bytes.len(),
            Data::Sym(expr) => expr.bits() as usize / 8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Data::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_sym(&self) -> Option<&SymExpr> {
        match self {
            Data::Sym(expr) => Some(expr),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Data {
        Data::Raw(bytes)
    }
}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Data {
        Data::Raw(bytes.to_vec())
    }
}

impl From<SymExpr> for Data {
    fn from(expr: SymExpr) -> Data {
        Data::Sym(expr)
    }
}

impl From<Either<Vec<u8>, SymExpr>> for Data {
    fn from(chunk: Either<Vec<u8>, SymExpr>) -> Data {
        match chunk {
            Either::Left(bytes) => Data::Raw(bytes),
            Either::Right(expr) => Data::Sym(expr),
        }
    }
}

impl From<Data> for Either<Vec<u8>, SymExpr> {
    fn from(data: Data) -> Self {
        match data {
            Data::Raw(bytes) => Either::Left(bytes),
            Data::Sym(expr) => Either::Right(expr),
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Raw(bytes) => {
                for b in bytes.iter() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Data::Sym(expr) => write!(f, "{}", expr),
        }
    }
}

/// A datum mapped at a zone-relative byte offset. The endianness records
/// which end of a symbolic datum its lowest-addressed byte holds.
#[derive(Debug, Clone)]
pub struct MemObject {
    vaddr: i64,
    data: Data,
    endian: Endian,
}

impl MemObject {
    pub fn new(vaddr: i64, data: Data, endian: Endian) -> MemObject {
        MemObject {
            vaddr,
            data,
            endian,
        }
    }

    pub fn vaddr(&self) -> i64 {
        self.vaddr
    }

    pub fn end(&self) -> i64 {
        self.vaddr + self.data.len() as i64
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// First `nbytes` bytes (lowest addresses).
    fn trunc(&self, nbytes: usize) -> MemObject {
        debug_assert!(nbytes <= self.data.len());
        let data = match &self.data {
            Data::Raw(bytes) => Data::Raw(bytes[..nbytes].to_vec()),
            Data::Sym(expr) => {
                let size = expr.bits();
                let cut = nbytes as u32 * 8;
                match self.endian {
                    Endian::Little => Data::Sym(expr.clone().extract(0, cut)),
                    Endian::Big => Data::Sym(expr.clone().extract(size - cut, size)),
                }
            }
        };
        MemObject {
            vaddr: self.vaddr,
            data,
            endian: self.endian,
        }
    }

    /// Everything past the first `nbytes` bytes; the offset moves with it.
    fn skip(&self, nbytes: usize) -> MemObject {
        debug_assert!(nbytes <= self.data.len());
        let data = match &self.data {
            Data::Raw(bytes) => Data::Raw(bytes[nbytes..].to_vec()),
            Data::Sym(expr) => {
                let size = expr.bits();
                let cut = nbytes as u32 * 8;
                match self.endian {
                    Endian::Little => Data::Sym(expr.clone().extract(cut, size)),
                    Endian::Big => Data::Sym(expr.clone().extract(0, size - cut)),
                }
            }
        };
        MemObject {
            vaddr: self.vaddr + nbytes as i64,
            data,
            endian: self.endian,
        }
    }

    /// Byte window `[lo, hi)` in zone-relative offsets, clamped to the
    /// object's own span.
    fn window(&self, lo: i64, hi: i64) -> MemObject {
        let lo = lo.max(self.vaddr);
        let hi = hi.min(self.end());
        self.skip((lo - self.vaddr) as usize)
            .trunc((hi - lo) as usize)
    }
}

impl fmt::Display for MemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}: {}", self.vaddr, self.data)
    }
}

/// One chunk of a read: either mapped data or a hole of `n` bytes.
#[derive(Debug, Clone)]
pub enum Part {
    Mapped(Data),
    Gap(usize),
}

/// Objects laid out over a common (possibly symbolic) base, kept sorted
/// by offset and non-overlapping. Later writes win; older objects keep
/// their remnants on both sides of the overwritten span.
#[derive(Debug, Clone, Default)]
pub struct MemoryZone {
    rel: Option<SymExpr>,
    map: Vec<MemObject>,
}

impl MemoryZone {
    pub fn new(rel: Option<SymExpr>) -> MemoryZone {
        MemoryZone {
            rel,
            map: Vec::new(),
        }
    }

    pub fn rel(&self) -> Option<&SymExpr> {
        self.rel.as_ref()
    }

    pub fn objects(&self) -> &[MemObject] {
        &self.map
    }

    /// Index of the first object ending after `offset`.
    fn locate(&self, offset: i64) -> usize {
        self.map.partition_point(|o| o.end() <= offset)
    }

    pub fn write(&mut self, offset: i64, data: Data, endian: Endian) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as i64;
        let lo = self.locate(offset);
        let hi = self.map.partition_point(|o| o.vaddr < end);

        let mut patched = Vec::with_capacity(self.map.len() + 2);
        patched.extend_from_slice(&self.map[..lo]);
        if let Some(first) = self.map.get(lo) {
            if first.vaddr < offset {
                patched.push(first.trunc((offset - first.vaddr) as usize));
            }
        }
        patched.push(MemObject::new(offset, data, endian));
        if hi > lo {
            let last = &self.map[hi - 1];
            if last.end() > end {
                patched.push(last.skip((end - last.vaddr) as usize));
            }
        }
        patched.extend_from_slice(&self.map[hi..]);
        self.map = patched;
        self.restruct();
    }

    /// Coalesces contiguous raw neighbours back into single objects.
    fn restruct(&mut self) {
        use itertools::Itertools;

        let objs = std::mem::take(&mut self.map);
        self.map = objs
            .into_iter()
            .coalesce(|a, b| match (a, b) {
                (
                    MemObject {
                        vaddr,
                        data: Data::Raw(mut x),
                        endian,
                    },
                    MemObject {
                        vaddr: vb,
                        data: Data::Raw(y),
                        endian: eb,
                    },
                ) if vaddr + x.len() as i64 == vb && endian == eb => {
                    x.extend_from_slice(&y);
                    Ok(MemObject::new(vaddr, Data::Raw(x), endian))
                }
                (a, b) => Err((a, b)),
            })
            .collect();
    }

    /// Every chunk covering `[offset, offset + nbytes)`, gaps included.
    pub fn read_parts(&self, offset: i64, nbytes: usize) -> Vec<Part> {
        let end = offset + nbytes as i64;
        let mut parts = Vec::new();
        let mut cursor = offset;
        for obj in &self.map[self.locate(offset)..] {
            if obj.vaddr >= end {
                break;
            }
            if obj.vaddr > cursor {
                parts.push(Part::Gap((obj.vaddr - cursor) as usize));
                cursor = obj.vaddr;
            }
            let piece = obj.window(cursor, end);
            cursor += piece.data.len() as i64;
            parts.push(Part::Mapped(piece.data));
        }
        if cursor < end {
            parts.push(Part::Gap((end - cursor) as usize));
        }
        parts
    }

    pub fn read(&self, offset: i64, nbytes: usize) -> Result<Vec<Data>, MemError> {
        let mut out = Vec::new();
        let mut cursor = offset;
        for part in self.read_parts(offset, nbytes) {
            match part {
                Part::Mapped(data) => {
                    cursor += data.len() as i64;
                    out.push(data);
                }
                Part::Gap(missing) => {
                    return Err(MemError::Unmapped {
                        address: cursor,
                        missing,
                    })
                }
            }
        }
        Ok(out)
    }

    /// Rebases every object by `offset` bytes.
    pub fn shift(&mut self, offset: i64) {
        for obj in self.map.iter_mut() {
            obj.vaddr += offset;
        }
    }
}

impl fmt::Display for MemoryZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rel {
            Some(ref rel) => writeln!(f, "<zone {}>", rel)?,
            None => writeln!(f, "<zone>")?,
        }
        for obj in &self.map {
            writeln!(f, "  {}", obj)?;
        }
        Ok(())
    }
}

/// Zoned memory: one zone for concrete addresses, one per symbolic base.
/// Accesses under distinct bases never alias.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    zones: FnvHashMap<Option<SymExpr>, MemoryZone>,
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap::default()
    }

    /// Splits an address expression into its zone key and the concrete
    /// offset within that zone.
    pub fn reference(address: &SymExpr) -> Result<(Option<SymExpr>, i64), MemError> {
        match &**address {
            Expr::Val(c) => Ok((None, c.value() as i64)),
            Expr::Top(_) => Err(MemError::BadReference(address.clone())),
            _ => {
                let (base, disp) = address.unoffset();
                if base.is_top() {
                    return Err(MemError::BadReference(address.clone()));
                }
                Ok((Some(base), disp))
            }
        }
    }

    pub fn zone(&self, rel: &Option<SymExpr>) -> Option<&MemoryZone> {
        self.zones.get(rel)
    }

    pub fn zones(&self) -> impl Iterator<Item = &MemoryZone> {
        self.zones.values()
    }

    pub fn write<D: Into<Data>>(
        &mut self,
        address: &SymExpr,
        data: D,
        endian: Endian,
    ) -> Result<(), MemError> {
        let data = data.into();
        if let Data::Sym(ref expr) = data {
            if expr.bits() % 8 != 0 {
                return Err(MemError::NotBytes(expr.bits()));
            }
        }
        let (rel, offset) = Self::reference(address)?;
        self.zones
            .entry(rel.clone())
            .or_insert_with(|| MemoryZone::new(rel))
            .write(offset, data, endian);
        Ok(())
    }

    /// Writes at a concrete address without building an expression.
    pub fn write_at<D: Into<Data>>(&mut self, address: u64, data: D, endian: Endian) {
        self.zones
            .entry(None)
            .or_insert_with(|| MemoryZone::new(None))
            .write(address as i64, data.into(), endian);
    }

    pub fn read(&self, address: &SymExpr, nbytes: usize) -> Result<Vec<Data>, MemError> {
        let (rel, offset) = Self::reference(address)?;
        match self.zones.get(&rel) {
            Some(zone) => zone.read(offset, nbytes),
            None => Err(MemError::Unmapped {
                address: offset,
                missing: nbytes,
            }),
        }
    }

    pub fn read_parts(&self, address: &SymExpr, nbytes: usize) -> Result<Vec<Part>, MemError> {
        let (rel, offset) = Self::reference(address)?;
        match self.zones.get(&rel) {
            Some(zone) => Ok(zone.read_parts(offset, nbytes)),
            None => Ok(vec![Part::Gap(nbytes)]),
        }
    }
}

impl fmt::Display for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for zone in self.zones.values() {
            write!(f, "{}", zone)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Reg;

    fn raw(zone: &MemoryZone, offset: i64, nbytes: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for d in zone.read(offset, nbytes).unwrap() {
            out.extend_from_slice(d.as_raw().unwrap());
        }
        out
    }

    #[test]
    fn overwrite_splits_and_keeps_remnants() {
        let mut zone = MemoryZone::new(None);
        zone.write(0, vec![0x11, 0x22, 0x33, 0x44].into(), Endian::Little);
        zone.write(1, vec![0xaa, 0xbb].into(), Endian::Little);
        assert_eq!(raw(&zone, 0, 4), vec![0x11, 0xaa, 0xbb, 0x44]);
        // contiguous raw parts coalesce back into one object
        assert_eq!(zone.objects().len(), 1);
    }

    #[test]
    fn symbolic_write_splits_by_extract() {
        let r = SymExpr::reg(Reg::new("r0", 32));
        let mut zone = MemoryZone::new(None);
        zone.write(0, r.clone().into(), Endian::Little);
        zone.write(1, vec![0x42].into(), Endian::Little);
        let parts = zone.read(0, 4).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].as_sym().unwrap(), &r.clone().extract(0, 8));
        assert_eq!(parts[1].as_raw().unwrap(), &[0x42]);
        assert_eq!(parts[2].as_sym().unwrap(), &r.extract(16, 32));
    }

    #[test]
    fn big_endian_symbolic_split() {
        let r = SymExpr::reg(Reg::new("r0", 32));
        let mut zone = MemoryZone::new(None);
        zone.write(0, r.clone().into(), Endian::Big);
        // lowest-addressed byte of a big-endian datum is its MSB
        let parts = zone.read(0, 1).unwrap();
        assert_eq!(parts[0].as_sym().unwrap(), &r.extract(24, 32));
    }

    #[test]
    fn gaps_are_reported() {
        let mut zone = MemoryZone::new(None);
        zone.write(0, vec![0x01, 0x02].into(), Endian::Little);
        zone.write(4, vec![0x05].into(), Endian::Little);
        match zone.read(0, 5) {
            Err(MemError::Unmapped { address, missing }) => {
                assert_eq!(address, 2);
                assert_eq!(missing, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        let parts = zone.read_parts(0, 5);
        assert!(matches!(parts[1], Part::Gap(2)));
    }

    #[test]
    fn zones_do_not_alias() {
        let sp = SymExpr::reg(Reg::new("sp", 32));
        let mut mmap = MemoryMap::new();
        mmap.write_at(0x1000, vec![0xde, 0xad], Endian::Little);
        mmap.write(
            &(&sp + &SymExpr::cst(4, 32)),
            vec![0xbe, 0xef],
            Endian::Little,
        )
        .unwrap();

        let concrete = SymExpr::cst(0x1000, 32);
        let got = mmap.read(&concrete, 2).unwrap();
        assert_eq!(got[0].as_raw().unwrap(), &[0xde, 0xad]);

        let stacked = &sp + &SymExpr::cst(4, 32);
        let got = mmap.read(&stacked, 2).unwrap();
        assert_eq!(got[0].as_raw().unwrap(), &[0xbe, 0xef]);

        // same offset, different base, never mixes
        assert!(mmap.read(&sp, 2).is_err());
    }

    #[test]
    fn unknown_base_is_rejected() {
        let mmap = MemoryMap::new();
        assert!(matches!(
            mmap.read(&SymExpr::top(32), 2),
            Err(MemError::BadReference(_))
        ));
    }

    #[test]
    fn non_byte_symbolic_write_is_rejected() {
        let mut mmap = MemoryMap::new();
        let addr = SymExpr::cst(0, 32);
        assert!(matches!(
            mmap.write(&addr, SymExpr::cst(1, 12), Endian::Little),
            Err(MemError::NotBytes(12))
        ));
        assert!(mmap
            .write(&addr, SymExpr::cst(1, 16), Endian::Little)
            .is_ok());
    }

    #[test]
    fn shift_rebases_objects() {
        let mut zone = MemoryZone::new(None);
        zone.write(0, vec![0x7f].into(), Endian::Little);
        zone.shift(0x100);
        assert_eq!(raw(&zone, 0x100, 1), vec![0x7f]);
    }
}
