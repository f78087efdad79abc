use crate::instructions::instructions::{ARCH_REG_COUNT, PhysRegType, RegisterType};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) struct RATEntry {
    pub(crate) phys_reg: PhysRegType,
    // if false, the committed physical register of the architectural register is current
    pub(crate) valid: bool,
}

/// The Register Alias Table. This structure is used for the register
/// renaming process. The RAT entry for a given architectural register
/// points to the physical register to use. As long as such a entry
/// exists, it should be used.
///
/// There is one extra entry for the zero flag; it always names the same
/// physical register as the youngest destination.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct RAT {
    table: Vec<RATEntry>,
}

impl RAT {
    pub fn new() -> Self {
        Self { table: vec![RATEntry::default(); ARCH_REG_COUNT as usize + 1] }
    }

    pub fn get(&self, arch_reg: RegisterType) -> &RATEntry {
        &self.table[arch_reg as usize]
    }

    pub fn map(&mut self, arch_reg: RegisterType, phys_reg: PhysRegType) {
        let entry = &mut self.table[arch_reg as usize];
        entry.phys_reg = phys_reg;
        entry.valid = true;
    }

    // Only when the entry still points to the retiring physical register should
    // it be invalidated; a younger instruction may have remapped it already.
    pub fn release(&mut self, arch_reg: RegisterType, phys_reg: PhysRegType) {
        let entry = &mut self.table[arch_reg as usize];
        if entry.valid && entry.phys_reg == phys_reg {
            entry.valid = false;
        }
    }

    // valid mappings of the real architectural registers, without the zero flag alias
    #[cfg(test)]
    pub(crate) fn live_mappings(&self) -> impl Iterator<Item=(RegisterType, PhysRegType)> + '_ {
        self.table[..ARCH_REG_COUNT as usize].iter()
            .enumerate()
            .filter(|(_, entry)| entry.valid)
            .map(|(arch_reg, entry)| (arch_reg as RegisterType, entry.phys_reg))
    }
}

#[cfg(test)]
mod tests {
    use crate::instructions::instructions::ZERO_FLAG;

    use super::*;

    #[test]
    fn test_map_and_release() {
        let mut rat = RAT::new();
        assert!(!rat.get(3).valid);

        rat.map(3, 17);
        assert_eq!(*rat.get(3), RATEntry { phys_reg: 17, valid: true });

        // a younger mapping must survive the release of an older one
        rat.map(3, 18);
        rat.release(3, 17);
        assert!(rat.get(3).valid);

        rat.release(3, 18);
        assert!(!rat.get(3).valid);
    }

    #[test]
    fn test_live_mappings_skip_zero_flag() {
        let mut rat = RAT::new();
        rat.map(1, 20);
        rat.map(ZERO_FLAG, 20);
        let live: Vec<_> = rat.live_mappings().collect();
        assert_eq!(live, vec![(1, 20)]);

        rat.release(1, 20);
        assert_eq!(rat.live_mappings().count(), 0);
        assert!(rat.get(ZERO_FLAG).valid);
    }
}
