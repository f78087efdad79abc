use log::info;
use thiserror::Error;

use crate::backend::branch_instruction_stack::BIS;
use crate::backend::execution_unit::{Completion, FunctionalUnit};
use crate::backend::issue_queue::{IQEntry, IssueQueue};
use crate::backend::physical_register::PhysRegFile;
use crate::backend::register_alias_table::RAT;
use crate::backend::reorder_buffer::{ROB, ROBSlot, ROBSlotState};
use crate::cpu::{ArchRegFile, CommitEvent, CPUConfig, PerfCounters, SimError, Trace};
use crate::frontend::frontend::{Frontend, PipelineLatch, SourceOperand};
use crate::instructions::instructions::{ARCH_REG_COUNT, Instr, Opcode, PhysRegType, RegisterType, UnitKind, WordType, ZERO_FLAG};
use crate::memory_subsystem::load_store_queue::LSQEntryKind;
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// Why an instruction could not leave decode this cycle. Neither is fatal:
/// the instruction stays in the decode latch and is retried next cycle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStall {
    #[error("no free physical register")]
    RegisterExhausted,
    #[error("the {0} is full")]
    StructuralStall(&'static str),
}

struct CDBBroadcast {
    phys_reg: PhysRegType,
    value: WordType,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RetireOutcome {
    IDLE,
    RETIRED,
    HALTED,
    FLUSHED,
}

pub(crate) struct Backend {
    pub(crate) phys_reg_file: PhysRegFile,
    pub(crate) rat: RAT,
    pub(crate) arch_reg_file: ArchRegFile,
    pub(crate) rob: ROB,
    pub(crate) iq: IssueQueue,
    pub(crate) bis: BIS,
    pub(crate) units: Vec<FunctionalUnit>,
    completions: Vec<Completion>,
    cdb_broadcast_buffer: Vec<CDBBroadcast>,
    trace: Trace,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Backend {
        let units = [UnitKind::Integer, UnitKind::Multiply, UnitKind::Branch, UnitKind::Memory]
            .into_iter()
            .map(|kind| FunctionalUnit::new(kind, cpu_config.memory_size))
            .collect::<Vec<_>>();

        Backend {
            trace: cpu_config.trace.clone(),
            phys_reg_file: PhysRegFile::new(cpu_config.phys_reg_count, ARCH_REG_COUNT as u16),
            rat: RAT::new(),
            arch_reg_file: ArchRegFile::new(),
            rob: ROB::new(cpu_config.rob_capacity),
            iq: IssueQueue::new(cpu_config.iq_capacity),
            bis: BIS::new(cpu_config.bis_capacity),
            completions: Vec::with_capacity(units.len() + 1),
            cdb_broadcast_buffer: Vec::with_capacity(units.len() + 1),
            units,
        }
    }

    // The stages are evaluated from the tail of the pipeline to the head, so
    // every stage sees the latches as the previous cycle left them.
    pub(crate) fn do_cycle(&mut self,
                           frontend: &mut Frontend,
                           memory_subsystem: &mut MemorySubsystem,
                           perf_counters: &mut PerfCounters,
                           commit_log: &mut Option<Vec<CommitEvent>>) -> Result<RetireOutcome, SimError> {
        let outcome = self.cycle_retire(frontend, memory_subsystem, perf_counters, commit_log)?;
        if outcome == RetireOutcome::FLUSHED || outcome == RetireOutcome::HALTED {
            return Ok(outcome);
        }

        self.cycle_memory(memory_subsystem)?;
        self.cycle_units(perf_counters);
        self.cycle_writeback(memory_subsystem);
        self.cycle_issue(perf_counters);
        self.cycle_dispatch(frontend, memory_subsystem, perf_counters);
        Ok(outcome)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rob.is_empty()
    }

    pub(crate) fn committed_value(&self, arch_reg: RegisterType) -> WordType {
        self.phys_reg_file.get(self.arch_reg_file.get_phys(arch_reg)).value
    }

    pub(crate) fn committed_zero_flag(&self) -> bool {
        match self.arch_reg_file.zero_flag() {
            Some(phys_reg) => self.phys_reg_file.get(phys_reg).value == 0,
            None => false,
        }
    }

    fn cycle_retire(&mut self,
                    frontend: &mut Frontend,
                    memory_subsystem: &mut MemorySubsystem,
                    perf_counters: &mut PerfCounters,
                    commit_log: &mut Option<Vec<CommitEvent>>) -> Result<RetireOutcome, SimError> {
        let rob_slot = match self.rob.retire_head() {
            Some(rob_slot) => rob_slot,
            None => return Ok(RetireOutcome::IDLE),
        };

        if rob_slot.state == ROBSlotState::FAULTED {
            return Err(SimError::AddressOutOfRange {
                pc: rob_slot.pc,
                address: rob_slot.fault_address.unwrap_or_default(),
                memory_size: memory_subsystem.memory.len(),
            });
        }

        if self.trace.retire {
            info!("Retiring pc({}) {}", rob_slot.pc, rob_slot.instr);
        }
        perf_counters.retired_cnt += 1;

        if let (Some(rd), Some(prd)) = (rob_slot.rd, rob_slot.prd) {
            let value = self.phys_reg_file.get(prd).value;
            let old_phys_reg = self.arch_reg_file.commit(rd, prd);
            debug_assert_eq!(Some(old_phys_reg), rob_slot.prev_prd);
            self.arch_reg_file.set_zero_flag(prd);

            // the mapping is committed state now
            for arch_reg in [rd, ZERO_FLAG] {
                self.rat.release(arch_reg, prd);
                self.bis.release_mapping(arch_reg, prd);
            }
            self.phys_reg_file.deallocate(old_phys_reg);

            if let Some(log) = commit_log.as_mut() {
                log.push(CommitEvent::Register { pc: rob_slot.pc, reg: rd, value });
            }
        }

        if rob_slot.has_lsq_entry {
            if let Some((address, value)) = memory_subsystem.commit(rob_slot.pc, rob_slot.seq)? {
                if let Some(log) = commit_log.as_mut() {
                    log.push(CommitEvent::Store { pc: rob_slot.pc, address, value });
                }
            }
        }

        if rob_slot.instr.opcode.is_branch() {
            frontend.btb.update(rob_slot.pc, rob_slot.branch_taken, rob_slot.branch_target_actual);

            if rob_slot.is_mispredicted() {
                perf_counters.branch_misprediction_cnt += 1;
                self.flush(&rob_slot, frontend, memory_subsystem, perf_counters);
                return Ok(RetireOutcome::FLUSHED);
            }

            perf_counters.branch_good_predictions_cnt += 1;
            let checkpoint = self.bis.release(rob_slot.seq);
            debug_assert!(checkpoint.map_or(false, |c| c.pc == rob_slot.pc),
                          "no checkpoint for branch at pc({})", rob_slot.pc);
        }

        if rob_slot.instr.opcode == Opcode::HALT {
            return Ok(RetireOutcome::HALTED);
        }

        Ok(RetireOutcome::RETIRED)
    }

    // Discards everything younger than the mispredicted branch and re-steers the frontend.
    fn flush(&mut self,
             branch: &ROBSlot,
             frontend: &mut Frontend,
             memory_subsystem: &mut MemorySubsystem,
             perf_counters: &mut PerfCounters) {
        let seq = branch.seq;

        let squashed = self.rob.flush_younger_than(seq);
        for rob_slot in &squashed {
            if let Some(prd) = rob_slot.prd {
                self.phys_reg_file.deallocate(prd);
            }
        }

        self.iq.flush_younger_than(seq);
        for unit in self.units.iter_mut() {
            unit.flush_younger_than(seq);
        }
        memory_subsystem.flush_younger_than(seq);

        match self.bis.restore(seq) {
            Some(rat) => self.rat = rat,
            None => panic!("no checkpoint for branch at pc({}) seq={}", branch.pc, seq),
        }
        self.completions.clear();
        self.cdb_broadcast_buffer.clear();

        frontend.flush(branch.branch_target_actual);

        if self.trace.pipeline_flush {
            info!("Pipeline flush at pc({}) {}: predicted={} actual={} squashed={}",
                  branch.pc, branch.instr, branch.branch_target_predicted, branch.branch_target_actual, squashed.len());
        }

        perf_counters.pipeline_flushes += 1;
        perf_counters.bad_speculation_cnt += squashed.len() as u64;
    }

    fn cycle_memory(&mut self, memory_subsystem: &mut MemorySubsystem) -> Result<(), SimError> {
        if let Some(load) = memory_subsystem.do_cycle()? {
            self.completions.push(Completion::Register { rob_seq: load.rob_seq, phys_reg: load.prd, value: load.value });
        }
        Ok(())
    }

    fn cycle_units(&mut self, perf_counters: &mut PerfCounters) {
        for unit in self.units.iter_mut() {
            if let Some((latch, completion)) = unit.do_cycle() {
                if self.trace.execute {
                    info!("Executed [{}] on {:?}: {:?}", latch, unit.kind, completion);
                }
                perf_counters.execute_cnt += 1;
                self.completions.push(completion);
            }
        }
    }

    fn cycle_writeback(&mut self, memory_subsystem: &mut MemorySubsystem) {
        for completion in self.completions.drain(..) {
            match completion {
                Completion::Register { rob_seq, phys_reg, value } => {
                    debug_assert!(!self.cdb_broadcast_buffer.iter().any(|b| b.phys_reg == phys_reg),
                                  "P{} has more than one writer in the same cycle", phys_reg);
                    self.phys_reg_file.write(phys_reg, value);
                    self.rob.complete(rob_seq);
                    self.cdb_broadcast_buffer.push(CDBBroadcast { phys_reg, value });
                }
                Completion::Branch { rob_seq, taken, target } => {
                    self.rob.resolve_branch(rob_seq, taken, target);
                }
                Completion::Address { rob_seq, address, store_value } => {
                    memory_subsystem.lsq.resolve(rob_seq, address, store_value);
                    // a store is done once address and value are known; a load waits for the LSQ
                    if store_value.is_some() {
                        self.rob.complete(rob_seq);
                    }
                }
                Completion::Fault { rob_seq, address } => {
                    self.rob.fault(rob_seq, address);
                    memory_subsystem.lsq.mark_faulted(rob_seq, address);
                }
            }
        }

        self.cdb_broadcast();
    }

    fn cdb_broadcast(&mut self) {
        for req in &self.cdb_broadcast_buffer {
            self.iq.wake(req.phys_reg, req.value);
        }

        self.cdb_broadcast_buffer.clear();
    }

    fn cycle_issue(&mut self, perf_counters: &mut PerfCounters) {
        for unit in self.units.iter_mut() {
            if !unit.can_accept() {
                continue;
            }

            if let Some(latch) = self.iq.select(unit.kind) {
                if self.trace.issue {
                    info!("Issued [{}] to {:?}", latch, unit.kind);
                }
                unit.accept(latch);
                perf_counters.issue_cnt += 1;
            }
        }
    }

    fn cycle_dispatch(&mut self,
                      frontend: &mut Frontend,
                      memory_subsystem: &mut MemorySubsystem,
                      perf_counters: &mut PerfCounters) {
        let mut latch = match frontend.decode_latch.take() {
            Some(latch) => latch,
            None => return,
        };

        match self.dispatch(&mut latch, frontend, memory_subsystem) {
            Ok(()) => perf_counters.dispatch_cnt += 1,
            Err(stall) => {
                match stall {
                    DispatchStall::RegisterExhausted => perf_counters.register_exhausted_cnt += 1,
                    DispatchStall::StructuralStall(_) => perf_counters.structural_stall_cnt += 1,
                }

                if self.trace.dispatch {
                    info!("Dispatch stalled [{}]: {}", latch, stall);
                }

                latch.stalled = true;
                frontend.decode_latch = Some(latch);
            }
        }
    }

    // Checked up front so that a stall never leaves a partially dispatched instruction behind.
    fn check_resources(&self, instr: &Instr, memory_subsystem: &MemorySubsystem) -> Result<(), DispatchStall> {
        if !self.rob.has_space() {
            return Err(DispatchStall::StructuralStall("ROB"));
        }

        if instr.opcode.unit_kind().is_some() && !self.iq.has_space() {
            return Err(DispatchStall::StructuralStall("IQ"));
        }

        if instr.opcode.is_memory() && !memory_subsystem.lsq.has_space() {
            return Err(DispatchStall::StructuralStall("LSQ"));
        }

        if instr.opcode.is_branch() && !self.bis.has_space() {
            return Err(DispatchStall::StructuralStall("BIS"));
        }

        if instr.writes_register() && !self.phys_reg_file.has_free() {
            return Err(DispatchStall::RegisterExhausted);
        }

        Ok(())
    }

    fn rename_source(&self, arch_reg: RegisterType) -> SourceOperand {
        let rat_entry = self.rat.get(arch_reg);
        let phys_reg = if rat_entry.valid {
            Some(rat_entry.phys_reg)
        } else if arch_reg == ZERO_FLAG {
            self.arch_reg_file.zero_flag()
        } else {
            Some(self.arch_reg_file.get_phys(arch_reg))
        };

        match phys_reg {
            Some(phys_reg) => {
                let entry = self.phys_reg_file.get(phys_reg);
                // we got lucky, there is a value in the physical register.
                let value = if entry.has_value { Some(entry.value) } else { None };
                SourceOperand { arch: arch_reg, phys: Some(phys_reg), value }
            }
            // nothing has written a register yet: the zero flag is clear
            None => SourceOperand { arch: arch_reg, phys: None, value: Some(1) },
        }
    }

    fn dispatch(&mut self,
                latch: &mut PipelineLatch,
                frontend: &mut Frontend,
                memory_subsystem: &mut MemorySubsystem) -> Result<(), DispatchStall> {
        let instr = latch.instr;
        self.check_resources(&instr, memory_subsystem)?;

        // sources are renamed before the destination, so ADD R1,R1,R2 reads the old R1
        for slot in latch.src.iter_mut() {
            if let Some(arch_reg) = slot.map(|operand| operand.arch) {
                *slot = Some(self.rename_source(arch_reg));
            }
        }

        let seq = self.rob.allocate(latch.pc, instr).ok_or(DispatchStall::StructuralStall("ROB"))?;
        latch.rob_seq = seq;

        let mut prev_prd = None;
        if let Some(rd) = instr.rd {
            let prd = self.phys_reg_file.allocate().ok_or(DispatchStall::RegisterExhausted)?;
            let rat_entry = self.rat.get(rd);
            prev_prd = Some(if rat_entry.valid { rat_entry.phys_reg } else { self.arch_reg_file.get_phys(rd) });

            // update the RAT entry to point to the newest phys_reg
            self.rat.map(rd, prd);
            self.rat.map(ZERO_FLAG, prd);
            latch.prd = Some(prd);
        }

        if instr.opcode.is_branch() {
            latch.predicted_target = frontend.btb.predict(latch.pc);
            self.bis.push(seq, latch.pc, &self.rat);
            frontend.redirect(latch.predicted_target);
        }

        if let Some(rob_slot) = self.rob.get_mut(seq) {
            rob_slot.prd = latch.prd;
            rob_slot.prev_prd = prev_prd;
            rob_slot.has_lsq_entry = instr.opcode.is_memory();
            rob_slot.branch_target_predicted = latch.predicted_target;
        }

        if instr.opcode.is_memory() {
            let kind = if instr.opcode.is_store() { LSQEntryKind::STORE } else { LSQEntryKind::LOAD };
            memory_subsystem.lsq.allocate(seq, latch.pc, kind, latch.prd);
        }

        latch.stalled = false;
        // waiting in the IQ does not hold a functional unit
        latch.busy = false;
        match instr.opcode.unit_kind() {
            Some(unit) => {
                let entry = IQEntry { unit, latch: latch.clone() };
                if self.trace.dispatch {
                    info!("Dispatched {}", entry);
                }
                self.iq.insert(entry);
            }
            // HALT and NOP need no functional unit
            None => {
                if self.trace.dispatch {
                    info!("Dispatched [{}] seq={} straight to the ROB", latch, seq);
                }
                self.rob.complete(seq);
            }
        }

        Ok(())
    }

    /// Verifies the renaming invariants: no two live RAT entries share a
    /// physical register, and every physical register is exactly one of
    /// free, committed or the destination of an in-flight instruction.
    #[cfg(test)]
    pub(crate) fn check_rename_state(&self) -> Result<(), String> {
        let count = self.phys_reg_file.count() as usize;

        let mut in_flight = vec![false; count];
        for rob_slot in self.rob.iter() {
            if let Some(prd) = rob_slot.prd {
                in_flight[prd as usize] = true;
            }
        }

        let mut mapped = vec![false; count];
        for (arch_reg, phys_reg) in self.rat.live_mappings() {
            if mapped[phys_reg as usize] {
                return Err(format!("P{} is mapped by more than one RAT entry (R{})", phys_reg, arch_reg));
            }
            if !in_flight[phys_reg as usize] {
                return Err(format!("RAT entry R{} maps P{} which is not in flight", arch_reg, phys_reg));
            }
            mapped[phys_reg as usize] = true;
        }

        let mut owners = vec![0u8; count];
        for phys_reg in 0..count {
            if self.phys_reg_file.is_free(phys_reg as PhysRegType) {
                owners[phys_reg] += 1;
            }
            if in_flight[phys_reg] {
                owners[phys_reg] += 1;
            }
        }
        for arch_reg in 0..ARCH_REG_COUNT {
            owners[self.arch_reg_file.get_phys(arch_reg) as usize] += 1;
        }

        match owners.iter().position(|&cnt| cnt != 1) {
            Some(phys_reg) => Err(format!("P{} has {} owners", phys_reg, owners[phys_reg])),
            None => Ok(()),
        }
    }
}
