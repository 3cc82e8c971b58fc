use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::bits::{Bits, Endian};
use crate::insn::Instruction;
use crate::ispec::{DecodeError, ISpec};

/// Decision tree over one spec table. Keys are computed from a window of
/// the first `keybits` fetched bits, so every pattern in the table can be
/// probed with one buffer.
#[derive(Debug)]
pub struct SpecTree {
    keybits: usize,
    root: TreeNode,
}

#[derive(Debug)]
enum TreeNode {
    Leaf(Vec<Arc<ISpec>>),
    Node {
        mask: Bits,
        subs: FnvHashMap<u128, TreeNode>,
    },
}

impl SpecTree {
    pub fn build(specs: &[Arc<ISpec>], endian: Endian) -> SpecTree {
        let keybits = specs
            .iter()
            .map(|s| s.mask().len())
            .min()
            .unwrap_or(0)
            .min(128);
        let entries = specs
            .iter()
            .map(|s| {
                let (kmask, kfix) = key_window(s, keybits, endian);
                (s.clone(), kmask, kfix)
            })
            .collect();
        SpecTree {
            keybits,
            root: TreeNode::build(entries),
        }
    }

    pub fn keybits(&self) -> usize {
        self.keybits
    }

    /// Candidate specs for the given key window, most constrained first.
    pub fn candidates(&self, window: &Bits) -> &[Arc<ISpec>] {
        self.root.walk(window)
    }
}

/// Portion of a spec's mask/fix covered by the first `keybits` fetched
/// bits: with big-endian fetch that is the top of the pattern, with
/// little-endian the bottom.
fn key_window(spec: &ISpec, keybits: usize, endian: Endian) -> (Bits, Bits) {
    let len = spec.mask().len();
    let (lo, hi) = match endian {
        Endian::Big => (len - keybits, len),
        Endian::Little => (0, keybits),
    };
    // in range by construction of keybits
    let kmask = spec.mask().slice(lo, hi).unwrap_or_else(|_| Bits::zero(keybits));
    let kfix = spec.fix().slice(lo, hi).unwrap_or_else(|_| Bits::zero(keybits));
    (kmask, kfix)
}

type Entry = (Arc<ISpec>, Bits, Bits);

impl TreeNode {
    fn build(mut entries: Vec<Entry>) -> TreeNode {
        if entries.len() < 2 {
            return TreeNode::Leaf(entries.into_iter().map(|e| e.0).collect());
        }
        // most constrained candidates first
        entries.sort_by(|a, b| b.1.hw().cmp(&a.1.hw()));
        let keybits = entries[0].1.len();
        let common = entries
            .iter()
            .fold(Bits::ones(keybits), |acc, (_, kmask, _)| &acc & kmask);
        if common.is_zero() {
            return TreeNode::Leaf(entries.into_iter().map(|e| e.0).collect());
        }
        let mut buckets: FnvHashMap<u128, Vec<Entry>> = FnvHashMap::default();
        let mut order = Vec::new();
        for entry in entries {
            let key = (&entry.2 & &common).int();
            if !buckets.contains_key(&key) {
                order.push(key);
            }
            buckets.entry(key).or_default().push(entry);
        }
        if order.len() == 1 {
            // nothing left to split on
            let only = buckets.remove(&order[0]).unwrap_or_default();
            return TreeNode::Leaf(only.into_iter().map(|e| e.0).collect());
        }
        TreeNode::Node {
            mask: common,
            subs: buckets
                .into_iter()
                .map(|(key, sub)| (key, TreeNode::build(sub)))
                .collect(),
        }
    }

    fn walk(&self, window: &Bits) -> &[Arc<ISpec>] {
        match self {
            TreeNode::Leaf(specs) => specs,
            TreeNode::Node { mask, subs } => {
                let key = (window & mask).int();
                match subs.get(&key) {
                    Some(sub) => sub.walk(window),
                    None => &[],
                }
            }
        }
    }
}

/// Mode-aware instruction decoder: one spec table per instruction set,
/// with decision trees built lazily on first use.
#[derive(Debug)]
pub struct Disassembler {
    tables: Vec<Vec<Arc<ISpec>>>,
    trees: Vec<Mutex<Option<Arc<SpecTree>>>>,
    endian: Endian,
    maxlen: usize,
}

impl Disassembler {
    pub fn new(tables: Vec<Vec<Arc<ISpec>>>, endian: Endian) -> Disassembler {
        fn spec_len(s: &Arc<ISpec>) -> usize {
            s.size().map(|b| b / 8).unwrap_or_else(|| s.min_len())
        }
        // the fetch window must fit a prefix plus the widest instruction
        let body = tables
            .iter()
            .flatten()
            .filter(|s| !s.is_prefix())
            .map(spec_len)
            .max()
            .unwrap_or(1);
        let prefix = tables
            .iter()
            .flatten()
            .filter(|s| s.is_prefix())
            .map(spec_len)
            .max()
            .unwrap_or(0);
        let maxlen = body + prefix;
        let trees = tables.iter().map(|_| Mutex::new(None)).collect();
        Disassembler {
            tables,
            trees,
            endian,
            maxlen,
        }
    }

    /// Overrides the fetch window, needed when variable-length patterns
    /// extend past their fixed part.
    pub fn with_max_len(mut self, maxlen: usize) -> Disassembler {
        self.maxlen = maxlen;
        self
    }

    pub fn max_len(&self) -> usize {
        self.maxlen
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn tree(&self, iset: usize) -> Arc<SpecTree> {
        let mut guard = self.trees[iset].lock();
        match &*guard {
            Some(tree) => tree.clone(),
            None => {
                let tree = Arc::new(SpecTree::build(&self.tables[iset], self.endian));
                *guard = Some(tree.clone());
                tree
            }
        }
    }

    /// Decodes one instruction at `address` using tree dispatch.
    pub fn disassemble(
        &self,
        bytes: &[u8],
        iset: usize,
        address: u64,
    ) -> Result<Instruction, DecodeError> {
        self.decode_with(bytes, iset, address, true)
    }

    /// Linear reference scan over the same table; must agree with
    /// [`Disassembler::disassemble`].
    pub fn disassemble_linear(
        &self,
        bytes: &[u8],
        iset: usize,
        address: u64,
    ) -> Result<Instruction, DecodeError> {
        self.decode_with(bytes, iset, address, false)
    }

    fn decode_with(
        &self,
        bytes: &[u8],
        iset: usize,
        address: u64,
        use_tree: bool,
    ) -> Result<Instruction, DecodeError> {
        let table = self.tables.get(iset).ok_or(DecodeError::NoMatch)?;
        if !use_tree {
            return self.try_specs(table, bytes, iset, address, use_tree);
        }
        let tree = self.tree(iset);
        let keybytes = (tree.keybits() + 7) / 8;
        if tree.keybits() == 0 || bytes.len() < keybytes {
            // not enough bytes to key the tree, fall back to the table
            return self.try_specs(table, bytes, iset, address, use_tree);
        }
        let buf = Bits::from_bytes(&bytes[..keybytes], self.endian);
        let window = match self.endian {
            Endian::Big => buf.slice(buf.len() - tree.keybits(), buf.len())?,
            Endian::Little => buf.slice(0, tree.keybits())?,
        };
        let candidates = tree.candidates(&window).to_vec();
        self.try_specs(&candidates, bytes, iset, address, use_tree)
    }

    fn try_specs(
        &self,
        specs: &[Arc<ISpec>],
        bytes: &[u8],
        iset: usize,
        address: u64,
        use_tree: bool,
    ) -> Result<Instruction, DecodeError> {
        for spec in specs {
            match spec.decode(bytes, self.endian) {
                Ok((mut insn, n)) => {
                    if spec.is_prefix() {
                        // a prefix only commits if the continuation decodes;
                        // otherwise the attempt is abandoned wholesale
                        match self.decode_with(&bytes[n..], iset, address + n as u64, use_tree) {
                            Ok(mut inner) => {
                                inner.prepend_prefix(&insn);
                                inner.set_address(address);
                                return Ok(inner);
                            }
                            Err(err) => {
                                log::debug!("prefix {} at {:#x} abandoned: {}", spec, address, err);
                                continue;
                            }
                        }
                    }
                    insn.set_address(address);
                    insn.set_spec(spec.clone());
                    return Ok(insn);
                }
                Err(DecodeError::Rejected(err)) => {
                    log::debug!("candidate {} at {:#x} rejected: {}", spec, address, err);
                }
                Err(DecodeError::Mismatch) | Err(DecodeError::Short(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Err(DecodeError::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::MiscValue;
    use crate::ispec::{Fields, InstructionError};

    fn imm_hook(insn: &mut Instruction, fields: &Fields) -> Result<(), InstructionError> {
        if let Some(imm) = fields.get("imm") {
            insn.set_misc("imm", imm.as_int() as i64);
        }
        Ok(())
    }

    fn toy_table() -> Vec<Arc<ISpec>> {
        vec![
            Arc::new(
                ISpec::new("16<[ 0000 0000 imm(8) ]", imm_hook)
                    .unwrap()
                    .mnemonic("li"),
            ),
            Arc::new(
                ISpec::new("16<[ 0000 0001 imm(8) ]", imm_hook)
                    .unwrap()
                    .mnemonic("inc"),
            ),
            Arc::new(
                ISpec::new("16<[ 0001 ---- imm(8) ]", imm_hook)
                    .unwrap()
                    .mnemonic("jmp"),
            ),
        ]
    }

    #[test]
    fn tree_dispatch_selects_by_fixed_bits() {
        let dis = Disassembler::new(vec![toy_table()], Endian::Big);
        let insn = dis.disassemble(&[0x00, 0x42], 0, 0x100).unwrap();
        assert_eq!(insn.mnemonic(), Some("li"));
        assert_eq!(insn.misc("imm"), Some(&MiscValue::Int(0x42)));
        assert_eq!(insn.address(), Some(0x100));

        let insn = dis.disassemble(&[0x01, 0x07], 0, 0x102).unwrap();
        assert_eq!(insn.mnemonic(), Some("inc"));

        let insn = dis.disassemble(&[0x17, 0xff], 0, 0x104).unwrap();
        assert_eq!(insn.mnemonic(), Some("jmp"));

        assert!(matches!(
            dis.disassemble(&[0xff, 0xff], 0, 0x106),
            Err(DecodeError::NoMatch)
        ));
    }

    #[test]
    fn tree_agrees_with_linear_scan() {
        let dis = Disassembler::new(vec![toy_table()], Endian::Big);
        for hi in 0..=0x3fu8 {
            for lo in [0x00, 0x42, 0xff] {
                let bytes = [hi, lo];
                let tree = dis.disassemble(&bytes, 0, 0);
                let linear = dis.disassemble_linear(&bytes, 0, 0);
                match (tree, linear) {
                    (Ok(a), Ok(b)) => {
                        assert_eq!(a.mnemonic(), b.mnemonic(), "bytes {:02x?}", bytes);
                        assert_eq!(a.bytes(), b.bytes());
                    }
                    (Err(_), Err(_)) => {}
                    (a, b) => panic!("diverged on {:02x?}: {:?} vs {:?}", bytes, a, b),
                }
            }
        }
    }

    #[test]
    fn prefix_consumes_and_marks() {
        let mut table = toy_table();
        table.push(Arc::new(
            ISpec::new("8<[ {66} ]+", imm_hook)
                .unwrap()
                .attr("opdsize", 16i64),
        ));
        let dis = Disassembler::new(vec![table], Endian::Big);

        let insn = dis.disassemble(&[0x66, 0x00, 0x42], 0, 0x200).unwrap();
        assert_eq!(insn.length(), 3);
        assert_eq!(insn.bytes(), &[0x66, 0x00, 0x42]);
        assert_eq!(insn.mnemonic(), Some("li"));
        assert_eq!(insn.misc("opdsize"), Some(&MiscValue::Int(16)));
        assert_eq!(insn.address(), Some(0x200));
    }

    #[test]
    fn dangling_prefix_is_abandoned() {
        let mut table = toy_table();
        table.push(Arc::new(ISpec::new("8<[ {66} ]+", imm_hook).unwrap()));
        let dis = Disassembler::new(vec![table], Endian::Big);
        // nothing decodable after the prefix byte
        assert!(matches!(
            dis.disassemble(&[0x66, 0xff, 0xff], 0, 0),
            Err(DecodeError::NoMatch)
        ));
        assert!(matches!(
            dis.disassemble(&[0x66], 0, 0),
            Err(DecodeError::NoMatch)
        ));
    }

    #[test]
    fn rejected_candidate_falls_through() {
        fn odd_only(insn: &mut Instruction, fields: &Fields) -> Result<(), InstructionError> {
            if fields.req("imm")?.as_int() % 2 == 0 {
                return Err(InstructionError::new("even immediate is reserved"));
            }
            imm_hook(insn, fields)
        }
        let table = vec![
            Arc::new(
                ISpec::new("16<[ 0000 0000 imm(8) ]", odd_only)
                    .unwrap()
                    .mnemonic("odd"),
            ),
            Arc::new(
                ISpec::new("16<[ 0000 ---- imm(8) ]", imm_hook)
                    .unwrap()
                    .mnemonic("any"),
            ),
        ];
        let dis = Disassembler::new(vec![table], Endian::Big);
        let insn = dis.disassemble(&[0x00, 0x03], 0, 0).unwrap();
        assert_eq!(insn.mnemonic(), Some("odd"));
        let insn = dis.disassemble(&[0x00, 0x04], 0, 0).unwrap();
        assert_eq!(insn.mnemonic(), Some("any"));
    }

    #[test]
    fn max_len_covers_the_widest_pattern() {
        let dis = Disassembler::new(vec![toy_table()], Endian::Big);
        assert_eq!(dis.max_len(), 2);
        let dis = dis.with_max_len(8);
        assert_eq!(dis.max_len(), 8);
    }

    #[test]
    fn max_len_reserves_room_for_a_prefix() {
        let mut table = toy_table();
        table.push(Arc::new(ISpec::new("8<[ {66} ]+", imm_hook).unwrap()));
        let dis = Disassembler::new(vec![table], Endian::Big);
        // one prefix byte on top of the widest instruction
        assert_eq!(dis.max_len(), 3);
    }
}
