use std::fmt;

use log::info;

use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::frontend::branch_target_buffer::BTB;
use crate::instructions::instructions::{CODE_BASE, Instr, INSTR_WIDTH, MAX_SOURCE_COUNT, Opcode, PhysRegType, Program, RegisterType, WordType};

/// A renamed source operand. `value` is present once the operand is known,
/// either at rename or later through a result-bus broadcast.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SourceOperand {
    pub arch: RegisterType,
    pub phys: Option<PhysRegType>,
    pub value: Option<WordType>,
}

/// The working copy of an in-flight instruction as it moves from stage to stage.
#[derive(Clone, Debug)]
pub struct PipelineLatch {
    pub pc: WordType,
    pub instr: Instr,
    pub src: [Option<SourceOperand>; MAX_SOURCE_COUNT],
    pub prd: Option<PhysRegType>,
    pub buffer: WordType,
    pub mem_address: Option<WordType>,
    pub rob_seq: u64,
    pub predicted_target: WordType,
    pub busy: bool,
    pub stalled: bool,
}

impl PipelineLatch {
    pub fn new(pc: WordType, instr: Instr) -> PipelineLatch {
        let mut src = [None; MAX_SOURCE_COUNT];
        for (slot, arch) in src.iter_mut().zip(instr.sources()) {
            *slot = arch.map(|arch| SourceOperand { arch, phys: None, value: None });
        }

        PipelineLatch {
            pc,
            instr,
            src,
            prd: None,
            buffer: 0,
            mem_address: None,
            rob_seq: 0,
            predicted_target: pc + INSTR_WIDTH,
            busy: true,
            stalled: false,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.instr.opcode
    }

    pub fn is_ready(&self) -> bool {
        self.src.iter().flatten().all(|s| s.value.is_some())
    }

    // the value of a source slot; only meaningful once the latch is ready.
    pub fn source_value(&self, slot: usize) -> WordType {
        let operand = self.src[slot];
        debug_assert!(operand.map_or(true, |s| s.value.is_some()), "source {} of [{}] has no value", slot, self);
        operand.and_then(|s| s.value).unwrap_or(0)
    }

    /// Captures a broadcast value. Returns true if any operand was waiting for `phys_reg`.
    pub fn wake(&mut self, phys_reg: PhysRegType, value: WordType) -> bool {
        let mut woken = false;
        for operand in self.src.iter_mut().flatten() {
            if operand.value.is_none() && operand.phys == Some(phys_reg) {
                operand.value = Some(value);
                woken = true;
            }
        }
        woken
    }
}

impl fmt::Display for PipelineLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instr)?;

        let renamed = self.prd.is_some() || self.src.iter().flatten().any(|s| s.phys.is_some());
        if renamed {
            let mut parts = Vec::new();
            if let Some(prd) = self.prd {
                parts.push(format!("P{}", prd));
            }
            for operand in self.src.iter().flatten() {
                match (operand.phys, operand.value) {
                    (Some(phys), _) => parts.push(format!("P{}", phys)),
                    (None, Some(value)) => parts.push(format!("#{}", value)),
                    (None, None) => {}
                }
            }
            write!(f, " -> [{}]", parts.join(","))?;
        }
        Ok(())
    }
}

pub(crate) struct Frontend {
    pub(crate) pc: WordType,
    // what fetch produced in the last cycle; kept for the stage snapshot
    pub(crate) fetch_latch: Option<PipelineLatch>,
    pub(crate) decode_latch: Option<PipelineLatch>,
    pub(crate) btb: BTB,
    halted: bool,
    trace: Trace,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Frontend {
        Frontend {
            pc: CODE_BASE,
            fetch_latch: None,
            decode_latch: None,
            btb: BTB::new(cpu_config.btb_capacity),
            halted: false,
            trace: cpu_config.trace.clone(),
        }
    }

    pub(crate) fn do_cycle(&mut self, program: &Program, perf_counters: &mut PerfCounters) {
        self.fetch_latch = None;

        if self.halted || self.decode_latch.is_some() {
            return;
        }

        let instr = match program.get_instr(self.pc) {
            Some(instr) => *instr,
            // running off the program is not an error; fetch just idles
            None => return,
        };

        let latch = PipelineLatch::new(self.pc, instr);
        if self.trace.fetch {
            info!("Fetch pc({}) {}", self.pc, latch);
        }

        if instr.opcode == Opcode::HALT {
            self.halted = true;
        }

        self.pc += INSTR_WIDTH;
        perf_counters.fetch_cnt += 1;
        self.fetch_latch = Some(latch.clone());
        self.decode_latch = Some(latch);
    }

    // speculative redirect by decode after consulting the BTB
    pub(crate) fn redirect(&mut self, pc: WordType) {
        self.pc = pc;
    }

    pub(crate) fn flush(&mut self, pc: WordType) {
        self.fetch_latch = None;
        self.decode_latch = None;
        self.halted = false;
        self.pc = pc;
    }

    pub(crate) fn is_idle(&self, program: &Program) -> bool {
        self.decode_latch.is_none() && (self.halted || program.get_instr(self.pc).is_none())
    }
}

#[cfg(test)]
mod tests {
    use crate::instructions::instructions::ZERO_FLAG;
    use crate::loader::loader::load_from_string;

    use super::*;

    #[test]
    fn test_fetch_stops_at_halt() {
        let program = load_from_string("MOVC,R0,#1\nHALT\nMOVC,R1,#2").unwrap();
        let mut frontend = Frontend::new(&CPUConfig::default());
        let mut perf_counters = PerfCounters::default();

        frontend.do_cycle(&program, &mut perf_counters);
        assert_eq!(frontend.decode_latch.as_ref().unwrap().pc, 4000);

        // decode latch still occupied: fetch stalls
        frontend.do_cycle(&program, &mut perf_counters);
        assert_eq!(frontend.pc, 4004);
        assert!(frontend.fetch_latch.is_none());

        frontend.decode_latch = None;
        frontend.do_cycle(&program, &mut perf_counters);
        assert_eq!(frontend.decode_latch.as_ref().unwrap().opcode(), Opcode::HALT);

        frontend.decode_latch = None;
        frontend.do_cycle(&program, &mut perf_counters);
        assert!(frontend.decode_latch.is_none());
        assert!(frontend.is_idle(&program));
        assert_eq!(perf_counters.fetch_cnt, 2);

        frontend.flush(4008);
        assert!(!frontend.is_idle(&program));
        frontend.do_cycle(&program, &mut perf_counters);
        assert_eq!(frontend.decode_latch.as_ref().unwrap().pc, 4008);
    }

    #[test]
    fn test_fetch_out_of_range_is_idle() {
        let program = load_from_string("NOP").unwrap();
        let mut frontend = Frontend::new(&CPUConfig::default());
        frontend.redirect(5000);
        frontend.do_cycle(&program, &mut PerfCounters::default());
        assert!(frontend.decode_latch.is_none());
        assert!(frontend.is_idle(&program));
    }

    #[test]
    fn test_latch_wake() {
        let program = load_from_string("ADD,R2,R0,R1\nBZ,#8").unwrap();
        let mut latch = PipelineLatch::new(4000, program.code[0]);
        latch.src[0] = Some(SourceOperand { arch: 0, phys: Some(17), value: None });
        latch.src[1] = Some(SourceOperand { arch: 1, phys: Some(3), value: Some(10) });
        assert!(!latch.is_ready());

        assert!(!latch.wake(18, 1));
        assert!(latch.wake(17, 5));
        assert!(latch.is_ready());
        assert_eq!(latch.source_value(0), 5);
        assert_eq!(latch.source_value(1), 10);

        let branch = PipelineLatch::new(4004, program.code[1]);
        assert_eq!(branch.src[0].unwrap().arch, ZERO_FLAG);
    }
}
