use crate::backend::register_alias_table::RAT;
use crate::instructions::instructions::{PhysRegType, RegisterType, WordType};

// A checkpoint of the rename state at the moment a branch was dispatched.
#[derive(Clone, Debug)]
pub(crate) struct BISEntry {
    pub(crate) rob_seq: u64,
    pub(crate) pc: WordType,
    pub(crate) rat: RAT,
}

/// The Branch Instruction Stack. Checkpoints are pushed in program order,
/// so the oldest unresolved branch is at the bottom.
pub(crate) struct BIS {
    capacity: u16,
    entries: Vec<BISEntry>,
}

impl BIS {
    pub(crate) fn new(capacity: u16) -> BIS {
        BIS { capacity, entries: Vec::with_capacity(capacity as usize) }
    }

    pub(crate) fn has_space(&self) -> bool {
        self.entries.len() < self.capacity as usize
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn push(&mut self, rob_seq: u64, pc: WordType, rat: &RAT) {
        assert!(self.has_space(), "BIS: can't push if no space.");
        debug_assert!(self.entries.last().map_or(true, |e| e.rob_seq < rob_seq));

        self.entries.push(BISEntry { rob_seq, pc, rat: rat.clone() });
    }

    // a correctly predicted branch retired; its checkpoint is no longer needed
    pub(crate) fn release(&mut self, rob_seq: u64) -> Option<BISEntry> {
        let index = self.entries.iter().position(|e| e.rob_seq == rob_seq)?;
        Some(self.entries.remove(index))
    }

    // Pops the checkpoint of a mispredicted branch together with every younger
    // checkpoint and returns the rename state to roll back to.
    pub(crate) fn restore(&mut self, rob_seq: u64) -> Option<RAT> {
        let index = self.entries.iter().position(|e| e.rob_seq == rob_seq)?;
        let entry = self.entries.swap_remove(index);
        self.entries.truncate(index);
        Some(entry.rat)
    }

    // A mapping became committed state; drop it from every checkpoint so a
    // rollback never resurrects it.
    pub(crate) fn release_mapping(&mut self, arch_reg: RegisterType, phys_reg: PhysRegType) {
        for entry in self.entries.iter_mut() {
            entry.rat.release(arch_reg, phys_reg);
        }
    }
}
