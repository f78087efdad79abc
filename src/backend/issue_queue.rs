use std::fmt;
use std::fmt::Display;

use crate::frontend::frontend::PipelineLatch;
use crate::instructions::instructions::{PhysRegType, UnitKind, WordType};

// A single issue queue entry
pub(crate) struct IQEntry {
    pub(crate) unit: UnitKind,
    pub(crate) latch: PipelineLatch,
}

impl Display for IQEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IQ {:?} seq={} {}", self.unit, self.latch.rob_seq, self.latch)
    }
}

/// Holds dispatched instructions until all their operands are known.
pub(crate) struct IssueQueue {
    slots: Vec<Option<IQEntry>>,
}

impl IssueQueue {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Self { slots }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn has_space(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    pub(crate) fn insert(&mut self, entry: IQEntry) {
        assert!(self.has_space(), "IQ: can't insert if no space.");
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
        }
    }

    // result-bus broadcast: every operand waiting for phys_reg captures the value
    pub(crate) fn wake(&mut self, phys_reg: PhysRegType, value: WordType) -> usize {
        let mut woken = 0;
        for entry in self.slots.iter_mut().flatten() {
            if entry.latch.wake(phys_reg, value) {
                woken += 1;
            }
        }
        woken
    }

    /// Removes and returns the oldest ready entry for the given unit.
    pub(crate) fn select(&mut self, unit: UnitKind) -> Option<PipelineLatch> {
        let index = self.slots.iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (index, entry)))
            .filter(|(_, entry)| entry.unit == unit && entry.latch.is_ready())
            .min_by_key(|(_, entry)| entry.latch.rob_seq)
            .map(|(index, _)| index)?;

        self.slots[index].take().map(|entry| entry.latch)
    }

    pub(crate) fn flush_younger_than(&mut self, rob_seq: u64) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map_or(false, |entry| entry.latch.rob_seq > rob_seq) {
                *slot = None;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item=&IQEntry> + '_ {
        self.slots.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use crate::frontend::frontend::SourceOperand;
    use crate::instructions::instructions::{Instr, Opcode};

    use super::*;

    fn entry(seq: u64, opcode: Opcode, waiting_on: Option<PhysRegType>) -> IQEntry {
        let mut latch = PipelineLatch::new(4000 + 4 * seq as i32, Instr::new(opcode));
        latch.rob_seq = seq;
        latch.src[0] = Some(SourceOperand { arch: 1, phys: waiting_on, value: if waiting_on.is_some() { None } else { Some(1) } });
        IQEntry { unit: opcode.unit_kind().unwrap(), latch }
    }

    #[test]
    fn test_select_oldest_ready() {
        let mut iq = IssueQueue::new(4);
        iq.insert(entry(5, Opcode::ADD, None));
        iq.insert(entry(2, Opcode::ADD, Some(20)));
        iq.insert(entry(3, Opcode::ADD, None));
        iq.insert(entry(1, Opcode::MUL, None));
        assert!(!iq.has_space());

        // seq 2 is older but not ready
        assert_eq!(iq.select(UnitKind::Integer).unwrap().rob_seq, 3);
        assert_eq!(iq.select(UnitKind::Branch).map(|l| l.rob_seq), None);
        assert_eq!(iq.select(UnitKind::Multiply).unwrap().rob_seq, 1);
        assert_eq!(iq.len(), 2);
    }

    #[test]
    fn test_wake() {
        let mut iq = IssueQueue::new(2);
        iq.insert(entry(0, Opcode::SUB, Some(20)));
        assert!(iq.select(UnitKind::Integer).is_none());

        assert_eq!(iq.wake(21, 7), 0);
        assert_eq!(iq.wake(20, 7), 1);
        let latch = iq.select(UnitKind::Integer).unwrap();
        assert_eq!(latch.source_value(0), 7);
        assert_eq!(iq.len(), 0);
    }

    #[test]
    fn test_flush_younger_than() {
        let mut iq = IssueQueue::new(4);
        iq.insert(entry(1, Opcode::ADD, Some(20)));
        iq.insert(entry(4, Opcode::ADD, Some(20)));
        iq.insert(entry(6, Opcode::BZ, Some(20)));
        iq.flush_younger_than(3);
        assert_eq!(iq.len(), 1);
        assert_eq!(iq.iter().next().unwrap().latch.rob_seq, 1);
    }
}
