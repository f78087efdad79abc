use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::backend::{Backend, RetireOutcome};
use crate::frontend::frontend::{Frontend, PipelineLatch};
use crate::instructions::instructions::{ARCH_REG_COUNT, PhysRegType, Program, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// A fatal simulation error. It is raised when the faulting instruction
/// retires; a fault on a squashed path never surfaces.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("pc({pc}): memory address {address} is outside of [0, {memory_size})")]
    AddressOutOfRange { pc: WordType, address: WordType, memory_size: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read the config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse the config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default)]
pub struct PerfCounters {
    pub cycle_cnt: u64,
    pub fetch_cnt: u64,
    pub dispatch_cnt: u64,
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    pub retired_cnt: u64,
    pub branch_good_predictions_cnt: u64,
    pub branch_misprediction_cnt: u64,
    pub pipeline_flushes: u64,
    // instructions squashed by pipeline flushes
    pub bad_speculation_cnt: u64,
    pub register_exhausted_cnt: u64,
    pub structural_stall_cnt: u64,
}

impl PerfCounters {
    pub fn ipc(&self) -> f32 {
        if self.cycle_cnt == 0 {
            return 0.0;
        }
        self.retired_cnt as f32 / self.cycle_cnt as f32
    }
}

impl fmt::Display for PerfCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cycles:                {}", self.cycle_cnt)?;
        writeln!(f, "fetched:               {}", self.fetch_cnt)?;
        writeln!(f, "dispatched:            {}", self.dispatch_cnt)?;
        writeln!(f, "issued:                {}", self.issue_cnt)?;
        writeln!(f, "executed:              {}", self.execute_cnt)?;
        writeln!(f, "retired:               {}", self.retired_cnt)?;
        writeln!(f, "IPC:                   {:.2}", self.ipc())?;
        writeln!(f, "good predictions:      {}", self.branch_good_predictions_cnt)?;
        writeln!(f, "mispredictions:        {}", self.branch_misprediction_cnt)?;
        writeln!(f, "pipeline flushes:      {}", self.pipeline_flushes)?;
        writeln!(f, "bad speculation:       {}", self.bad_speculation_cnt)?;
        writeln!(f, "register exhausted:    {}", self.register_exhausted_cnt)?;
        write!(f, "structural stalls:     {}", self.structural_stall_cnt)
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Trace {
    pub fetch: bool,
    pub dispatch: bool,
    pub issue: bool,
    pub execute: bool,
    pub retire: bool,
    pub cycle: bool,
    pub pipeline_flush: bool,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct CPUConfig {
    // the number of physical registers; the first 16 hold the initial architectural state
    pub phys_reg_count: u16,
    // the capacity of the issue queue
    pub iq_capacity: u16,
    // the capacity of the load-store queue
    pub lsq_capacity: u16,
    // the capacity of the reorder buffer
    pub rob_capacity: u16,
    // the maximum number of unresolved branches in flight
    pub bis_capacity: u16,
    // the number of branches the branch target buffer remembers
    pub btb_capacity: u16,
    // the size of the data memory in words
    pub memory_size: u32,
    // the run stops after this many cycles, complete or not
    pub cycle_budget: u64,
    // if every committed register write and store should be recorded
    pub commit_log: bool,
    // if processing of a single instruction should be traced (logged)
    pub trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            phys_reg_count: 24,
            iq_capacity: 8,
            lsq_capacity: 6,
            rob_capacity: 12,
            bis_capacity: 12,
            btb_capacity: 2,
            memory_size: 4096,
            cycle_budget: 100_000,
            commit_log: false,
            trace: Trace::default(),
        }
    }
}

impl CPUConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phys_reg_count <= ARCH_REG_COUNT as u16 {
            return Err(ConfigError::Invalid(format!(
                "phys_reg_count must be larger than {}, found {}", ARCH_REG_COUNT, self.phys_reg_count)));
        }

        for (name, capacity) in [("rob_capacity", self.rob_capacity),
                                 ("iq_capacity", self.iq_capacity),
                                 ("lsq_capacity", self.lsq_capacity),
                                 ("bis_capacity", self.bis_capacity)] {
            if capacity == 0 {
                return Err(ConfigError::Invalid(format!("{} can't be 0", name)));
            }
        }

        if self.memory_size == 0 {
            return Err(ConfigError::Invalid("memory_size can't be 0".to_string()));
        }

        Ok(())
    }
}

pub fn load_cpu_config(file_path: &Path) -> Result<CPUConfig, ConfigError> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

/// The committed architectural state: the physical register holding each
/// architectural register, and the one holding the zero flag source.
pub(crate) struct ArchRegFile {
    committed: Vec<PhysRegType>,
    zero_flag: Option<PhysRegType>,
}

impl ArchRegFile {
    pub(crate) fn new() -> ArchRegFile {
        ArchRegFile {
            committed: (0..ARCH_REG_COUNT as PhysRegType).collect(),
            zero_flag: None,
        }
    }

    pub(crate) fn get_phys(&self, reg: RegisterType) -> PhysRegType {
        self.committed[reg as usize]
    }

    // returns the physical register that is no longer architectural
    pub(crate) fn commit(&mut self, reg: RegisterType, phys_reg: PhysRegType) -> PhysRegType {
        std::mem::replace(&mut self.committed[reg as usize], phys_reg)
    }

    pub(crate) fn zero_flag(&self) -> Option<PhysRegType> {
        self.zero_flag
    }

    pub(crate) fn set_zero_flag(&mut self, phys_reg: PhysRegType) {
        self.zero_flag = Some(phys_reg);
    }
}

/// An architectural effect, in commit order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommitEvent {
    Register { pc: WordType, reg: RegisterType, value: WordType },
    Store { pc: WordType, address: WordType, value: WordType },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ArchState {
    pub registers: Vec<WordType>,
    pub zero_flag: bool,
    pub memory: Vec<WordType>,
}

impl ArchState {
    pub fn register(&self, reg: RegisterType) -> WordType {
        self.registers[reg as usize]
    }
}

/// The content of one pipeline stage, for display.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StageSnapshot {
    pub stage: &'static str,
    pub pc: Option<WordType>,
    pub instr: Option<String>,
}

impl StageSnapshot {
    fn of(stage: &'static str, latch: Option<&PipelineLatch>) -> StageSnapshot {
        StageSnapshot {
            stage,
            pc: latch.map(|l| l.pc),
            instr: latch.map(|l| l.to_string()),
        }
    }
}

impl fmt::Display for StageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pc, &self.instr) {
            (Some(pc), Some(instr)) => write!(f, "{:<15}: pc({}) {}", self.stage, pc, instr),
            _ => write!(f, "{:<15}: Empty", self.stage),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RunOutcome {
    // false if the cycle budget ran out first
    pub completed: bool,
    pub cycles: u64,
}

pub struct CPU {
    program: Program,
    frontend: Frontend,
    backend: Backend,
    memory_subsystem: MemorySubsystem,
    perf_counters: PerfCounters,
    commit_log: Option<Vec<CommitEvent>>,
    cycle_budget: u64,
    trace: Trace,
    complete: bool,
    // a fatal error leaves the pipeline half retired; it is reported on every later step
    failed: Option<SimError>,
}

impl CPU {
    pub fn new(cpu_config: &CPUConfig, program: Program) -> CPU {
        CPU {
            program,
            frontend: Frontend::new(cpu_config),
            backend: Backend::new(cpu_config),
            memory_subsystem: MemorySubsystem::new(cpu_config),
            perf_counters: PerfCounters::default(),
            commit_log: if cpu_config.commit_log { Some(Vec::new()) } else { None },
            cycle_budget: cpu_config.cycle_budget,
            trace: cpu_config.trace.clone(),
            complete: false,
            failed: None,
        }
    }

    /// Advances the machine by one clock cycle. Returns true once the program
    /// has completed. Once an error is returned, every later call returns it again.
    pub fn step(&mut self) -> Result<bool, SimError> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }

        if self.complete {
            return Ok(true);
        }

        self.perf_counters.cycle_cnt += 1;

        let outcome = match self.backend.do_cycle(
            &mut self.frontend,
            &mut self.memory_subsystem,
            &mut self.perf_counters,
            &mut self.commit_log) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.failed = Some(error.clone());
                return Err(error);
            }
        };

        // a flush re-steers fetch, which starts on the next cycle
        if outcome == RetireOutcome::RETIRED || outcome == RetireOutcome::IDLE {
            self.frontend.do_cycle(&self.program, &mut self.perf_counters);
        }

        if self.trace.cycle {
            let perf_counters = &self.perf_counters;
            info!("[Cycles:{}][Fetched={}][Dispatched={}][Issued={}][Executed={}][Retired={}][IPC={:.2}]",
                  perf_counters.cycle_cnt,
                  perf_counters.fetch_cnt,
                  perf_counters.dispatch_cnt,
                  perf_counters.issue_cnt,
                  perf_counters.execute_cnt,
                  perf_counters.retired_cnt,
                  perf_counters.ipc());
        }

        if outcome == RetireOutcome::HALTED
            || (self.frontend.is_idle(&self.program) && self.backend.is_empty()) {
            self.complete = true;
        }

        Ok(self.complete)
    }

    pub fn run(&mut self) -> Result<RunOutcome, SimError> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }

        while !self.complete && self.perf_counters.cycle_cnt < self.cycle_budget {
            self.step()?;
        }

        if self.complete {
            info!("Program complete after {} cycles", self.perf_counters.cycle_cnt);
        } else {
            info!("Cycle budget of {} exhausted", self.cycle_budget);
        }

        Ok(RunOutcome { completed: self.complete, cycles: self.perf_counters.cycle_cnt })
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn architectural_state(&self) -> ArchState {
        ArchState {
            registers: (0..ARCH_REG_COUNT).map(|reg| self.backend.committed_value(reg)).collect(),
            zero_flag: self.backend.committed_zero_flag(),
            memory: self.memory_subsystem.memory.clone(),
        }
    }

    /// The content of every pipeline stage, head to tail.
    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        let mut snapshots = vec![
            StageSnapshot::of("Fetch", self.frontend.fetch_latch.as_ref()),
            StageSnapshot::of("Decode/Rename", self.frontend.decode_latch.as_ref()),
        ];

        for unit in &self.backend.units {
            for (name, latch) in unit.stages() {
                snapshots.push(StageSnapshot::of(name, latch));
            }
        }

        let head = self.backend.rob.head();
        snapshots.push(StageSnapshot {
            stage: "ROB head",
            pc: head.map(|slot| slot.pc),
            instr: head.map(|slot| slot.instr.to_string()),
        });

        snapshots
    }

    pub fn perf_counters(&self) -> &PerfCounters {
        &self.perf_counters
    }

    pub fn commit_log(&self) -> &[CommitEvent] {
        self.commit_log.as_deref().unwrap_or(&[])
    }

    #[cfg(test)]
    pub(crate) fn check_rename_state(&self) -> Result<(), String> {
        self.backend.check_rename_state()
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    #[cfg(test)]
    pub(crate) fn memory_subsystem(&self) -> &MemorySubsystem {
        &self.memory_subsystem
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CPUConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.phys_reg_count, 24);
        assert_eq!(config.memory_size, 4096);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: CPUConfig = serde_yaml::from_str("rob_capacity: 4\ntrace:\n  retire: true\n").unwrap();
        assert_eq!(config.rob_capacity, 4);
        assert_eq!(config.iq_capacity, 8);
        assert!(config.trace.retire);
        assert!(!config.trace.fetch);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = CPUConfig::default();
        config.phys_reg_count = 16;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CPUConfig::default();
        config.lsq_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("lsq_capacity")));

        let mut config = CPUConfig::default();
        config.memory_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_cpu_config() {
        let path = std::env::temp_dir().join(format!("apex_cpu_config_{}.yaml", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "phys_reg_count: 32\nbtb_capacity: 4").unwrap();
        drop(file);

        let config = load_cpu_config(&path).unwrap();
        assert_eq!(config.phys_reg_count, 32);
        assert_eq!(config.btb_capacity, 4);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(load_cpu_config(Path::new("/does/not/exist.yaml")), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_arch_reg_file_commit() {
        let mut arch_reg_file = ArchRegFile::new();
        assert_eq!(arch_reg_file.get_phys(3), 3);
        assert_eq!(arch_reg_file.zero_flag(), None);

        assert_eq!(arch_reg_file.commit(3, 20), 3);
        assert_eq!(arch_reg_file.commit(3, 17), 20);
        arch_reg_file.set_zero_flag(17);
        assert_eq!(arch_reg_file.zero_flag(), Some(17));
    }

    #[test]
    fn test_stage_snapshot_display() {
        let empty = StageSnapshot { stage: "MUL1_FU", pc: None, instr: None };
        assert_eq!(empty.to_string(), "MUL1_FU        : Empty");

        let busy = StageSnapshot { stage: "Fetch", pc: Some(4000), instr: Some("MOVC,R0,#5".to_string()) };
        assert_eq!(busy.to_string(), "Fetch          : pc(4000) MOVC,R0,#5");
    }
}
