use crate::instructions::instructions::{INSTR_WIDTH, WordType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BTBEntry {
    pub(crate) pc: WordType,
    pub(crate) target: WordType,
    pub(crate) taken: bool,
    last_used: u64,
}

/// A small fully associative branch target buffer with LRU replacement.
///
/// An entry remembers the last outcome of the branch at `pc`; a hit on a
/// taken entry predicts its target, anything else predicts fall-through.
pub(crate) struct BTB {
    capacity: u16,
    entries: Vec<BTBEntry>,
    clock: u64,
}

impl BTB {
    pub(crate) fn new(capacity: u16) -> BTB {
        BTB { capacity, entries: Vec::with_capacity(capacity as usize), clock: 0 }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn lookup(&mut self, pc: WordType) -> Option<BTBEntry> {
        let now = self.tick();
        let entry = self.entries.iter_mut().find(|e| e.pc == pc)?;
        entry.last_used = now;
        Some(*entry)
    }

    pub(crate) fn predict(&mut self, pc: WordType) -> WordType {
        match self.lookup(pc) {
            Some(entry) if entry.taken => entry.target,
            _ => pc + INSTR_WIDTH,
        }
    }

    pub(crate) fn update(&mut self, pc: WordType, taken: bool, target: WordType) {
        if self.capacity == 0 {
            return;
        }

        let now = self.tick();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.pc == pc) {
            entry.taken = taken;
            entry.target = target;
            entry.last_used = now;
            return;
        }

        if self.entries.len() == self.capacity as usize {
            let victim = self.entries.iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(index, _)| index);
            if let Some(index) = victim {
                self.entries.swap_remove(index);
            }
        }

        self.entries.push(BTBEntry { pc, target, taken, last_used: now });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_predicts_fall_through() {
        let mut btb = BTB::new(2);
        assert_eq!(btb.predict(4004), 4008);
    }

    #[test]
    fn test_taken_entry_predicts_target() {
        let mut btb = BTB::new(2);
        btb.update(4004, true, 4012);
        assert_eq!(btb.predict(4004), 4012);

        btb.update(4004, false, 4008);
        assert_eq!(btb.predict(4004), 4008);
        assert_eq!(btb.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let mut btb = BTB::new(2);
        btb.update(4000, true, 4100);
        btb.update(4004, true, 4200);
        // touch 4000 so that 4004 becomes the least recently used
        assert!(btb.lookup(4000).is_some());
        btb.update(4008, true, 4300);

        assert_eq!(btb.len(), 2);
        assert!(btb.lookup(4004).is_none());
        assert_eq!(btb.predict(4000), 4100);
        assert_eq!(btb.predict(4008), 4300);
    }

    #[test]
    fn test_zero_capacity() {
        let mut btb = BTB::new(0);
        btb.update(4000, true, 4100);
        assert_eq!(btb.len(), 0);
        assert_eq!(btb.predict(4000), 4004);
    }
}
