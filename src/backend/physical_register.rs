use crate::instructions::instructions::{PhysRegType, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
enum PhysRegEntryState {
    IDLE,
    BUSY,
}

pub(crate) struct PhysRegEntry {
    pub(crate) value: WordType,
    pub(crate) has_value: bool,
    state: PhysRegEntryState,
}

impl PhysRegEntry {
    fn reset(&mut self) {
        self.value = 0;
        self.has_value = false;
        self.state = PhysRegEntryState::IDLE;
    }
}

pub(crate) struct PhysRegFile {
    free_stack: Vec<PhysRegType>,
    entries: Vec<PhysRegEntry>,
}

impl PhysRegFile {
    // The first `committed_count` registers start out as the committed home of
    // the architectural registers, holding 0. The rest are free.
    pub(crate) fn new(count: u16, committed_count: u16) -> PhysRegFile {
        debug_assert!(committed_count <= count);

        let mut free_stack = Vec::with_capacity(count as usize);
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let committed = i < committed_count;
            entries.push(PhysRegEntry {
                value: 0,
                has_value: committed,
                state: if committed { PhysRegEntryState::BUSY } else { PhysRegEntryState::IDLE },
            });
        }

        // lowest numbered register is handed out first
        for i in (committed_count..count).rev() {
            free_stack.push(i);
        }

        PhysRegFile { entries, free_stack }
    }

    pub(crate) fn get(&self, reg: PhysRegType) -> &PhysRegEntry {
        let entry = &self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY, "phys register {} is not in busy state", reg);
        entry
    }

    pub(crate) fn has_free(&self) -> bool {
        !self.free_stack.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free_stack.len()
    }

    #[cfg(test)]
    pub(crate) fn is_free(&self, reg: PhysRegType) -> bool {
        self.entries[reg as usize].state == PhysRegEntryState::IDLE
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub(crate) fn allocate(&mut self) -> Option<PhysRegType> {
        let reg = self.free_stack.pop()?;
        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::IDLE);
        debug_assert!(!entry.has_value, "The allocated physical register {} should not have a value", reg);
        entry.state = PhysRegEntryState::BUSY;
        Some(reg)
    }

    pub(crate) fn write(&mut self, reg: PhysRegType, value: WordType) {
        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY, "write to phys register {} which is not busy", reg);
        debug_assert!(!entry.has_value, "phys register {} written twice", reg);
        entry.value = value;
        entry.has_value = true;
    }

    pub(crate) fn deallocate(&mut self, reg: PhysRegType) {
        debug_assert!(!self.free_stack.contains(&reg), "Phys register {} can't be deallocated while it is also on the free stack", reg);

        let entry = &mut self.entries[reg as usize];
        debug_assert!(entry.state == PhysRegEntryState::BUSY);
        entry.reset();

        self.free_stack.push(reg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let regs = PhysRegFile::new(24, 16);
        assert_eq!(regs.free_count(), 8);
        assert!(regs.get(3).has_value);
        assert_eq!(regs.get(3).value, 0);
        assert!(regs.is_free(16));
        assert!(!regs.is_free(15));
    }

    #[test]
    fn test_allocate() {
        let mut regs = PhysRegFile::new(24, 16);
        let reg = regs.allocate().unwrap();
        assert_eq!(reg, 16);

        let entry = regs.get(reg);
        assert_eq!(entry.state, PhysRegEntryState::BUSY);
        assert!(!entry.has_value);
    }

    #[test]
    fn test_exhausted() {
        let mut regs = PhysRegFile::new(18, 16);
        assert_eq!(regs.allocate(), Some(16));
        assert_eq!(regs.allocate(), Some(17));
        assert!(!regs.has_free());
        assert_eq!(regs.allocate(), None);

        regs.deallocate(16);
        assert_eq!(regs.allocate(), Some(16));
    }

    #[test]
    fn test_write_and_deallocate() {
        let mut regs = PhysRegFile::new(20, 16);
        let reg = regs.allocate().unwrap();
        regs.write(reg, 42);
        assert_eq!(regs.get(reg).value, 42);

        regs.deallocate(reg);
        assert!(regs.is_free(reg));
        assert_eq!(regs.free_count(), 4);
    }
}
