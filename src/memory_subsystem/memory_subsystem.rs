use log::info;

use crate::cpu::{CPUConfig, SimError, Trace};
use crate::instructions::instructions::{PhysRegType, WordType};
use crate::memory_subsystem::load_store_queue::{LSQ, LSQEntryKind};

/// A load result ready for the result bus.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct LoadResult {
    pub(crate) rob_seq: u64,
    pub(crate) prd: PhysRegType,
    pub(crate) value: WordType,
}

pub(crate) struct MemorySubsystem {
    pub(crate) memory: Vec<WordType>,
    pub(crate) lsq: LSQ,
    trace: Trace,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: vec![0; cpu_config.memory_size as usize],
            lsq: LSQ::new(cpu_config.lsq_capacity),
            trace: cpu_config.trace.clone(),
        }
    }

    fn check_address(&self, pc: WordType, address: WordType) -> Result<usize, SimError> {
        if address < 0 || address as usize >= self.memory.len() {
            return Err(SimError::AddressOutOfRange { pc, address, memory_size: self.memory.len() });
        }
        Ok(address as usize)
    }

    pub(crate) fn read(&self, pc: WordType, address: WordType) -> Result<WordType, SimError> {
        let index = self.check_address(pc, address)?;
        Ok(self.memory[index])
    }

    pub(crate) fn write(&mut self, pc: WordType, address: WordType, value: WordType) -> Result<(), SimError> {
        let index = self.check_address(pc, address)?;
        self.memory[index] = value;
        Ok(())
    }

    // At most one load accesses memory per cycle.
    pub(crate) fn do_cycle(&mut self) -> Result<Option<LoadResult>, SimError> {
        let access = match self.lsq.next_load() {
            Some(access) => access,
            None => return Ok(None),
        };

        let value = match access.forwarded {
            Some(value) => value,
            None => self.read(access.pc, access.address)?,
        };

        if self.trace.execute {
            info!("Load seq={} mem[{}]={}{}", access.rob_seq, access.address, value,
                  if access.forwarded.is_some() { " (forwarded)" } else { "" });
        }

        self.lsq.mark_performed(access.rob_seq);
        Ok(Some(LoadResult { rob_seq: access.rob_seq, prd: access.prd, value }))
    }

    /// Retires the oldest memory operation. A store performs its deferred
    /// write now; the written (address, value) pair is returned.
    pub(crate) fn commit(&mut self, pc: WordType, rob_seq: u64) -> Result<Option<(WordType, WordType)>, SimError> {
        let entry = self.lsq.commit_head(rob_seq);
        match entry.kind {
            LSQEntryKind::LOAD => Ok(None),
            LSQEntryKind::STORE => {
                self.write(pc, entry.address, entry.value)?;
                Ok(Some((entry.address, entry.value)))
            }
        }
    }

    pub(crate) fn flush_younger_than(&mut self, rob_seq: u64) {
        self.lsq.flush_younger_than(rob_seq);
    }
}
