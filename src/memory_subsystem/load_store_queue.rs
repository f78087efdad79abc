use LSQEntryState::{ALLOCATED, FAULTED, IDLE, PERFORMED, READY};

use crate::instructions::instructions::{PhysRegType, WordType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LSQEntryKind {
    LOAD,
    STORE,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LSQEntryState {
    // not used.
    IDLE,
    // allocated at dispatch; the address is not known yet
    ALLOCATED,
    // the address (and for a store the value) is known. A store stays in this
    // state until it retires and is written to memory.
    READY,
    // a load that has read its value
    PERFORMED,
    // the address is outside of memory; the ROB raises the error if it retires
    FAULTED,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LSQEntry {
    pub(crate) rob_seq: u64,
    pub(crate) pc: WordType,
    pub(crate) kind: LSQEntryKind,
    pub(crate) prd: Option<PhysRegType>,
    pub(crate) address: WordType,
    pub(crate) value: WordType,
    pub(crate) state: LSQEntryState,
}

impl LSQEntry {
    fn reset(&mut self) {
        self.state = IDLE;
        self.prd = None;
        self.address = 0;
        self.value = 0;
    }
}

/// A load that is allowed to access memory this cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct LoadAccess {
    pub(crate) rob_seq: u64,
    pub(crate) pc: WordType,
    pub(crate) prd: PhysRegType,
    pub(crate) address: WordType,
    // the value of an older store to the same address, if there is one
    pub(crate) forwarded: Option<WordType>,
}

/// The load-store queue: memory operations in program order.
pub(crate) struct LSQ {
    head: u64,
    tail: u64,
    entries: Vec<LSQEntry>,
    capacity: u16,
}

impl LSQ {
    pub(crate) fn new(capacity: u16) -> LSQ {
        let entries = vec![LSQEntry {
            rob_seq: 0,
            pc: 0,
            kind: LSQEntryKind::LOAD,
            prd: None,
            address: 0,
            value: 0,
            state: IDLE,
        }; capacity as usize];

        LSQ { capacity, head: 0, tail: 0, entries }
    }

    fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    pub(crate) fn allocate(&mut self, rob_seq: u64, pc: WordType, kind: LSQEntryKind, prd: Option<PhysRegType>) {
        assert!(self.has_space(), "LSQ: can't allocate because there is no space");
        debug_assert!(kind == LSQEntryKind::STORE || prd.is_some());

        let index = self.to_index(self.tail);
        let entry = &mut self.entries[index];
        debug_assert!(entry.state == IDLE);
        entry.rob_seq = rob_seq;
        entry.pc = pc;
        entry.kind = kind;
        entry.prd = prd;
        entry.state = ALLOCATED;
        self.tail += 1;
    }

    fn find_mut(&mut self, rob_seq: u64) -> Option<&mut LSQEntry> {
        let capacity = self.capacity as u64;
        let index = (self.head..self.tail)
            .map(|seq| (seq % capacity) as usize)
            .find(|index| self.entries[*index].rob_seq == rob_seq)?;
        Some(&mut self.entries[index])
    }

    // the memory unit computed the address (and for stores the value)
    pub(crate) fn resolve(&mut self, rob_seq: u64, address: WordType, store_value: Option<WordType>) {
        let entry = self.find_mut(rob_seq).unwrap_or_else(|| panic!("LSQ: no entry for seq {}", rob_seq));
        debug_assert!(entry.state == ALLOCATED);
        debug_assert!((entry.kind == LSQEntryKind::STORE) == store_value.is_some());
        entry.address = address;
        entry.value = store_value.unwrap_or(0);
        entry.state = READY;
    }

    pub(crate) fn mark_faulted(&mut self, rob_seq: u64, address: WordType) {
        if let Some(entry) = self.find_mut(rob_seq) {
            entry.address = address;
            entry.state = FAULTED;
        }
    }

    /// Finds the oldest load that may access memory: its address is known and
    /// every older store has a known address. A store with an unknown address
    /// blocks every younger load.
    pub(crate) fn next_load(&self) -> Option<LoadAccess> {
        for seq in self.head..self.tail {
            let entry = &self.entries[self.to_index(seq)];
            match (entry.kind, entry.state) {
                (LSQEntryKind::STORE, ALLOCATED) => return None,
                (LSQEntryKind::LOAD, READY) => {
                    let prd = entry.prd?;
                    return Some(LoadAccess {
                        rob_seq: entry.rob_seq,
                        pc: entry.pc,
                        prd,
                        address: entry.address,
                        forwarded: self.forward(seq, entry.address),
                    });
                }
                _ => {}
            }
        }
        None
    }

    // the value of the youngest store older than `load_seq` that writes `address`
    fn forward(&self, load_seq: u64, address: WordType) -> Option<WordType> {
        (self.head..load_seq)
            .rev()
            .map(|seq| &self.entries[self.to_index(seq)])
            .find(|e| e.kind == LSQEntryKind::STORE && e.state == READY && e.address == address)
            .map(|e| e.value)
    }

    pub(crate) fn mark_performed(&mut self, rob_seq: u64) {
        if let Some(entry) = self.find_mut(rob_seq) {
            debug_assert!(entry.kind == LSQEntryKind::LOAD && entry.state == READY);
            entry.state = PERFORMED;
        }
    }

    /// Pops the head at retirement. The caller writes a returned store to memory.
    pub(crate) fn commit_head(&mut self, rob_seq: u64) -> LSQEntry {
        assert!(!self.is_empty(), "LSQ: commit of seq {} on an empty queue", rob_seq);

        let index = self.to_index(self.head);
        let entry = self.entries[index];
        debug_assert!(entry.rob_seq == rob_seq, "LSQ: head is seq {}, but seq {} retires", entry.rob_seq, rob_seq);
        self.entries[index].reset();
        self.head += 1;
        entry
    }

    pub(crate) fn flush_younger_than(&mut self, rob_seq: u64) {
        while self.tail > self.head {
            let index = self.to_index(self.tail - 1);
            if self.entries[index].rob_seq <= rob_seq {
                break;
            }
            self.entries[index].reset();
            self.tail -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_waits_for_older_store_address() {
        let mut lsq = LSQ::new(4);
        lsq.allocate(1, 4000, LSQEntryKind::STORE, None);
        lsq.allocate(2, 4000, LSQEntryKind::LOAD, Some(20));

        lsq.resolve(2, 8, None);
        // the store address is unknown; the load may alias it
        assert_eq!(lsq.next_load(), None);

        lsq.resolve(1, 9, Some(77));
        assert_eq!(lsq.next_load(), Some(LoadAccess { rob_seq: 2, pc: 4000, prd: 20, address: 8, forwarded: None }));
    }

    #[test]
    fn test_forward_from_youngest_older_store() {
        let mut lsq = LSQ::new(6);
        lsq.allocate(1, 4000, LSQEntryKind::STORE, None);
        lsq.allocate(2, 4000, LSQEntryKind::STORE, None);
        lsq.allocate(3, 4000, LSQEntryKind::LOAD, Some(20));
        lsq.allocate(4, 4000, LSQEntryKind::STORE, None);

        lsq.resolve(1, 5, Some(10));
        lsq.resolve(2, 5, Some(11));
        lsq.resolve(3, 5, None);
        // the younger store (seq 4) does not matter for the load, even unresolved
        let access = lsq.next_load().unwrap();
        assert_eq!(access.forwarded, Some(11));

        lsq.mark_performed(3);
        assert_eq!(lsq.next_load(), None);
    }

    #[test]
    fn test_commit_and_flush() {
        let mut lsq = LSQ::new(3);
        lsq.allocate(1, 4000, LSQEntryKind::STORE, None);
        lsq.allocate(5, 4000, LSQEntryKind::LOAD, Some(21));
        lsq.allocate(6, 4000, LSQEntryKind::STORE, None);
        assert!(!lsq.has_space());

        lsq.flush_younger_than(1);
        assert_eq!(lsq.size(), 1);

        lsq.resolve(1, 3, Some(4));
        let entry = lsq.commit_head(1);
        assert_eq!(entry.kind, LSQEntryKind::STORE);
        assert_eq!((entry.address, entry.value), (3, 4));
        assert!(lsq.is_empty());

        // wraps around after the flush
        for seq in 7..10 {
            lsq.allocate(seq, 4000, LSQEntryKind::LOAD, Some(16));
        }
        assert_eq!(lsq.size(), 3);
    }

    #[test]
    fn test_faulted_load_is_never_performed() {
        let mut lsq = LSQ::new(2);
        lsq.allocate(1, 4000, LSQEntryKind::LOAD, Some(20));
        lsq.mark_faulted(1, 5000);
        assert_eq!(lsq.next_load(), None);
    }
}
