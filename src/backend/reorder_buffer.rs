use crate::instructions::instructions::{Instr, INSTR_WIDTH, PhysRegType, RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ROBSlotState {
    IDLE,
    // waiting for its result
    DISPATCHED,
    COMPLETED,
    // completed with an out of range memory address; fatal once it retires
    FAULTED,
}

#[derive(Clone, Debug)]
pub(crate) struct ROBSlot {
    pub(crate) seq: u64,
    pub(crate) pc: WordType,
    pub(crate) instr: Instr,
    pub(crate) state: ROBSlotState,
    pub(crate) rd: Option<RegisterType>,
    pub(crate) prd: Option<PhysRegType>,
    // the mapping of rd before this instruction; freed when this instruction retires
    pub(crate) prev_prd: Option<PhysRegType>,
    pub(crate) has_lsq_entry: bool,
    pub(crate) branch_target_predicted: WordType,
    pub(crate) branch_target_actual: WordType,
    pub(crate) branch_taken: bool,
    pub(crate) fault_address: Option<WordType>,
}

impl ROBSlot {
    fn new(seq: u64, pc: WordType, instr: Instr) -> ROBSlot {
        ROBSlot {
            seq,
            pc,
            instr,
            state: ROBSlotState::DISPATCHED,
            rd: instr.rd,
            prd: None,
            prev_prd: None,
            has_lsq_entry: false,
            branch_target_predicted: pc + INSTR_WIDTH,
            branch_target_actual: pc + INSTR_WIDTH,
            branch_taken: false,
            fault_address: None,
        }
    }

    pub(crate) fn is_mispredicted(&self) -> bool {
        self.branch_target_actual != self.branch_target_predicted
    }
}

/// The reorder buffer: a circular buffer of in-flight instructions in
/// program order. Slots are addressed by a monotonically increasing
/// sequence number; the slot index is `seq % capacity`.
pub(crate) struct ROB {
    capacity: u16,
    // everything before this point is retired.
    head: u64,
    tail: u64,
    slots: Vec<Option<ROBSlot>>,
}

impl ROB {
    pub(crate) fn new(capacity: u16) -> Self {
        Self {
            capacity,
            tail: 0,
            head: 0,
            slots: vec![None; capacity as usize],
        }
    }

    pub(crate) fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.capacity > self.size()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    pub(crate) fn allocate(&mut self, pc: WordType, instr: Instr) -> Option<u64> {
        if !self.has_space() {
            return None;
        }

        let seq = self.tail;
        let index = self.to_index(seq);
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(ROBSlot::new(seq, pc, instr));
        self.tail += 1;
        Some(seq)
    }

    pub(crate) fn get(&self, seq: u64) -> Option<&ROBSlot> {
        if seq < self.head || seq >= self.tail {
            return None;
        }
        self.slots[self.to_index(seq)].as_ref()
    }

    pub(crate) fn get_mut(&mut self, seq: u64) -> Option<&mut ROBSlot> {
        if seq < self.head || seq >= self.tail {
            return None;
        }
        let index = self.to_index(seq);
        self.slots[index].as_mut()
    }

    pub(crate) fn head(&self) -> Option<&ROBSlot> {
        self.get(self.head)
    }

    pub(crate) fn head_state(&self) -> ROBSlotState {
        self.head().map_or(ROBSlotState::IDLE, |slot| slot.state)
    }

    pub(crate) fn complete(&mut self, seq: u64) {
        let slot = self.get_mut(seq).unwrap_or_else(|| panic!("ROB: complete of unknown seq {}", seq));
        debug_assert!(slot.state == ROBSlotState::DISPATCHED, "ROB: seq {} completed twice", seq);
        slot.state = ROBSlotState::COMPLETED;
    }

    pub(crate) fn fault(&mut self, seq: u64, address: WordType) {
        let slot = self.get_mut(seq).unwrap_or_else(|| panic!("ROB: fault of unknown seq {}", seq));
        slot.fault_address = Some(address);
        slot.state = ROBSlotState::FAULTED;
    }

    pub(crate) fn resolve_branch(&mut self, seq: u64, taken: bool, target: WordType) {
        let slot = self.get_mut(seq).unwrap_or_else(|| panic!("ROB: resolve of unknown seq {}", seq));
        debug_assert!(slot.instr.opcode.is_branch());
        slot.branch_taken = taken;
        slot.branch_target_actual = target;
        slot.state = ROBSlotState::COMPLETED;
    }

    // Removes the head if it has completed (or faulted).
    pub(crate) fn retire_head(&mut self) -> Option<ROBSlot> {
        match self.head_state() {
            ROBSlotState::COMPLETED | ROBSlotState::FAULTED => {}
            ROBSlotState::IDLE | ROBSlotState::DISPATCHED => return None,
        }

        let index = self.to_index(self.head);
        self.head += 1;
        self.slots[index].take()
    }

    /// Discards every slot younger than `seq`, youngest first, and returns them.
    pub(crate) fn flush_younger_than(&mut self, seq: u64) -> Vec<ROBSlot> {
        let mut squashed = Vec::new();
        while self.tail > self.head && self.tail - 1 > seq {
            self.tail -= 1;
            let index = self.to_index(self.tail);
            if let Some(slot) = self.slots[index].take() {
                squashed.push(slot);
            }
        }
        squashed
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item=&ROBSlot> + '_ {
        (self.head..self.tail).filter_map(move |seq| self.get(seq))
    }
}

#[cfg(test)]
mod tests {
    use crate::instructions::instructions::Opcode;

    use super::*;

    fn nop() -> Instr {
        Instr::new(Opcode::NOP)
    }

    #[test]
    fn test_allocate_until_full() {
        let mut rob = ROB::new(2);
        assert_eq!(rob.allocate(4000, nop()), Some(0));
        assert_eq!(rob.allocate(4004, nop()), Some(1));
        assert!(!rob.has_space());
        assert_eq!(rob.allocate(4008, nop()), None);
        assert_eq!(rob.size(), 2);
    }

    #[test]
    fn test_retire_in_order() {
        let mut rob = ROB::new(4);
        let first = rob.allocate(4000, nop()).unwrap();
        let second = rob.allocate(4004, nop()).unwrap();

        // the younger one completes first, but can't pass the head
        rob.complete(second);
        assert!(rob.retire_head().is_none());

        rob.complete(first);
        assert_eq!(rob.retire_head().unwrap().seq, first);
        assert_eq!(rob.retire_head().unwrap().seq, second);
        assert!(rob.is_empty());
    }

    #[test]
    fn test_wraps_around() {
        let mut rob = ROB::new(2);
        for round in 0..5u64 {
            let seq = rob.allocate(4000, nop()).unwrap();
            assert_eq!(seq, round);
            rob.complete(seq);
            assert_eq!(rob.retire_head().unwrap().seq, round);
        }
        assert!(rob.is_empty());
    }

    #[test]
    fn test_flush_younger_than() {
        let mut rob = ROB::new(8);
        for k in 0..5 {
            rob.allocate(4000 + 4 * k, nop());
        }
        let squashed = rob.flush_younger_than(1);
        let seqs: Vec<u64> = squashed.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![4, 3, 2]);
        assert_eq!(rob.size(), 2);
        assert!(rob.get(2).is_none());
        assert_eq!(rob.iter().count(), 2);

        // new allocations reuse the discarded sequence numbers
        assert_eq!(rob.allocate(4008, nop()), Some(2));
    }

    #[test]
    fn test_fault_retires() {
        let mut rob = ROB::new(2);
        let seq = rob.allocate(4000, Instr::new(Opcode::LOAD)).unwrap();
        rob.fault(seq, 9999);
        let slot = rob.retire_head().unwrap();
        assert_eq!(slot.state, ROBSlotState::FAULTED);
        assert_eq!(slot.fault_address, Some(9999));
    }
}
