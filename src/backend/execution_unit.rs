use crate::frontend::frontend::PipelineLatch;
use crate::instructions::instructions::{INSTR_WIDTH, Opcode, PhysRegType, UnitKind, WordType};

/// What a functional unit hands to the result bus when an instruction leaves its last stage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Completion {
    Register { rob_seq: u64, phys_reg: PhysRegType, value: WordType },
    Branch { rob_seq: u64, taken: bool, target: WordType },
    Address { rob_seq: u64, address: WordType, store_value: Option<WordType> },
    Fault { rob_seq: u64, address: WordType },
}

/// A fixed-latency functional unit: a shift register of pipeline stages.
pub(crate) struct FunctionalUnit {
    pub(crate) kind: UnitKind,
    stage_names: &'static [&'static str],
    stages: Vec<Option<PipelineLatch>>,
    memory_size: u32,
}

#[allow(non_snake_case)]
impl FunctionalUnit {
    pub(crate) fn new(kind: UnitKind, memory_size: u32) -> FunctionalUnit {
        let stage_names: &'static [&'static str] = match kind {
            UnitKind::Integer => &["INT1_FU", "INT2_FU"],
            UnitKind::Multiply => &["MUL1_FU", "MUL2_FU", "MUL3_FU"],
            UnitKind::Branch => &["BR_FU"],
            UnitKind::Memory => &["MEM_FU"],
        };

        let mut stages = Vec::with_capacity(stage_names.len());
        stages.resize_with(stage_names.len(), || None);

        FunctionalUnit { kind, stage_names, stages, memory_size }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.stages.len()
    }

    pub(crate) fn can_accept(&self) -> bool {
        self.stages[0].is_none()
    }

    pub(crate) fn accept(&mut self, mut latch: PipelineLatch) {
        debug_assert!(self.can_accept(), "{:?} unit: first stage is occupied", self.kind);
        debug_assert!(latch.is_ready());
        latch.stalled = false;
        latch.busy = true;
        self.stages[0] = Some(latch);
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.stages.iter().all(|s| s.is_none())
    }

    pub(crate) fn stages(&self) -> impl Iterator<Item=(&'static str, Option<&PipelineLatch>)> + '_ {
        self.stage_names.iter().copied().zip(self.stages.iter().map(|s| s.as_ref()))
    }

    /// Advances the unit by one cycle. The last stage executes and leaves the
    /// unit, so every other latch moves one stage forward.
    pub(crate) fn do_cycle(&mut self) -> Option<(PipelineLatch, Completion)> {
        let last = self.stages.len() - 1;

        let completed = self.stages[last].take().map(|mut latch| {
            let completion = self.execute(&latch);
            match completion {
                Completion::Register { value, .. } => latch.buffer = value,
                Completion::Branch { target, .. } => latch.buffer = target,
                Completion::Address { address, .. } | Completion::Fault { address, .. } => latch.mem_address = Some(address),
            }
            latch.busy = false;
            (latch, completion)
        });

        for stage in (0..last).rev() {
            debug_assert!(self.stages[stage + 1].is_none());
            self.stages[stage + 1] = self.stages[stage].take();
        }

        completed
    }

    pub(crate) fn flush_younger_than(&mut self, rob_seq: u64) {
        for stage in self.stages.iter_mut() {
            if stage.as_ref().map_or(false, |latch| latch.rob_seq > rob_seq) {
                *stage = None;
            }
        }
    }

    fn execute(&self, latch: &PipelineLatch) -> Completion {
        let rob_seq = latch.rob_seq;
        match self.kind {
            UnitKind::Integer | UnitKind::Multiply => {
                let value = match latch.opcode() {
                    Opcode::MOVC => Self::execute_MOVC(latch),
                    Opcode::ADD => Self::execute_ADD(latch),
                    Opcode::SUB => Self::execute_SUB(latch),
                    Opcode::AND => Self::execute_AND(latch),
                    Opcode::OR => Self::execute_OR(latch),
                    Opcode::EXOR => Self::execute_EXOR(latch),
                    Opcode::ADDL => Self::execute_ADDL(latch),
                    Opcode::SUBL => Self::execute_SUBL(latch),
                    Opcode::MUL => Self::execute_MUL(latch),
                    opcode => unreachable!("{:?} on the {:?} unit", opcode, self.kind),
                };
                let phys_reg = latch.prd.unwrap_or_else(|| panic!("[{}] has no physical destination", latch));
                Completion::Register { rob_seq, phys_reg, value }
            }
            UnitKind::Branch => {
                let (taken, target) = match latch.opcode() {
                    Opcode::BZ => Self::execute_BZ(latch),
                    Opcode::BNZ => Self::execute_BNZ(latch),
                    Opcode::JUMP => Self::execute_JUMP(latch),
                    opcode => unreachable!("{:?} on the branch unit", opcode),
                };
                Completion::Branch { rob_seq, taken, target }
            }
            UnitKind::Memory => {
                let (address, store_value) = match latch.opcode() {
                    Opcode::LOAD => Self::execute_LOAD(latch),
                    Opcode::LDR => Self::execute_LDR(latch),
                    Opcode::STORE => Self::execute_STORE(latch),
                    Opcode::STR => Self::execute_STR(latch),
                    opcode => unreachable!("{:?} on the memory unit", opcode),
                };

                if address < 0 || address as u32 >= self.memory_size {
                    Completion::Fault { rob_seq, address }
                } else {
                    Completion::Address { rob_seq, address, store_value }
                }
            }
        }
    }

    fn execute_MOVC(latch: &PipelineLatch) -> WordType {
        latch.instr.imm
    }

    fn execute_ADD(latch: &PipelineLatch) -> WordType {
        latch.source_value(0).wrapping_add(latch.source_value(1))
    }

    fn execute_SUB(latch: &PipelineLatch) -> WordType {
        latch.source_value(0).wrapping_sub(latch.source_value(1))
    }

    fn execute_AND(latch: &PipelineLatch) -> WordType {
        latch.source_value(0) & latch.source_value(1)
    }

    fn execute_OR(latch: &PipelineLatch) -> WordType {
        latch.source_value(0) | latch.source_value(1)
    }

    fn execute_EXOR(latch: &PipelineLatch) -> WordType {
        latch.source_value(0) ^ latch.source_value(1)
    }

    fn execute_ADDL(latch: &PipelineLatch) -> WordType {
        latch.source_value(0).wrapping_add(latch.instr.imm)
    }

    fn execute_SUBL(latch: &PipelineLatch) -> WordType {
        latch.source_value(0).wrapping_sub(latch.instr.imm)
    }

    fn execute_MUL(latch: &PipelineLatch) -> WordType {
        latch.source_value(0).wrapping_mul(latch.source_value(1))
    }

    fn relative_target(latch: &PipelineLatch, taken: bool) -> (bool, WordType) {
        if taken {
            (true, latch.pc.wrapping_add(latch.instr.imm))
        } else {
            (false, latch.pc + INSTR_WIDTH)
        }
    }

    // source 0 holds the value of the last register write; zero means the flag is set
    fn execute_BZ(latch: &PipelineLatch) -> (bool, WordType) {
        Self::relative_target(latch, latch.source_value(0) == 0)
    }

    fn execute_BNZ(latch: &PipelineLatch) -> (bool, WordType) {
        Self::relative_target(latch, latch.source_value(0) != 0)
    }

    fn execute_JUMP(latch: &PipelineLatch) -> (bool, WordType) {
        (true, latch.source_value(0).wrapping_add(latch.instr.imm))
    }

    fn execute_LOAD(latch: &PipelineLatch) -> (WordType, Option<WordType>) {
        (latch.source_value(0).wrapping_add(latch.instr.imm), None)
    }

    fn execute_LDR(latch: &PipelineLatch) -> (WordType, Option<WordType>) {
        (latch.source_value(0).wrapping_add(latch.source_value(1)), None)
    }

    fn execute_STORE(latch: &PipelineLatch) -> (WordType, Option<WordType>) {
        (latch.source_value(1).wrapping_add(latch.instr.imm), Some(latch.source_value(0)))
    }

    fn execute_STR(latch: &PipelineLatch) -> (WordType, Option<WordType>) {
        (latch.source_value(1).wrapping_add(latch.source_value(2)), Some(latch.source_value(0)))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::frontend::frontend::SourceOperand;
    use crate::loader::loader::load_from_string;

    use super::*;

    // builds a ready latch for a single line of assembly with the given source values
    fn ready_latch(src: &str, values: &[WordType]) -> PipelineLatch {
        let program = load_from_string(src).unwrap();
        let mut latch = PipelineLatch::new(4000, program.code[0]);
        for (slot, value) in latch.src.iter_mut().flatten().zip(values) {
            *slot = SourceOperand { arch: slot.arch, phys: None, value: Some(*value) };
        }
        latch.prd = Some(20);
        latch.rob_seq = 7;
        latch
    }

    fn run_to_completion(unit: &mut FunctionalUnit, latch: PipelineLatch) -> (usize, Completion) {
        unit.accept(latch);
        let mut cycles = 0;
        loop {
            cycles += 1;
            if let Some((_, completion)) = unit.do_cycle() {
                return (cycles, completion);
            }
        }
    }

    #[rstest]
    #[case("MOVC,R1,#42", &[], 42)]
    #[case("ADD,R1,R2,R3", &[5, 10], 15)]
    #[case("SUB,R1,R2,R3", &[5, 10], -5)]
    #[case("AND,R1,R2,R3", &[0b1100, 0b1010], 0b1000)]
    #[case("OR,R1,R2,R3", &[0b1100, 0b1010], 0b1110)]
    #[case("EX-OR,R1,R2,R3", &[0b1100, 0b1010], 0b0110)]
    #[case("ADDL,R1,R2,#-3", &[10], 7)]
    #[case("SUBL,R1,R2,#3", &[10], 7)]
    #[case("ADD,R1,R2,R3", &[i32::MAX, 1], i32::MIN)]
    fn test_integer_unit(#[case] src: &str, #[case] values: &[WordType], #[case] expected: WordType) {
        let mut unit = FunctionalUnit::new(UnitKind::Integer, 4096);
        let (cycles, completion) = run_to_completion(&mut unit, ready_latch(src, values));
        assert_eq!(cycles, 2);
        assert_eq!(completion, Completion::Register { rob_seq: 7, phys_reg: 20, value: expected });
        assert!(unit.is_empty());
    }

    #[test]
    fn test_multiply_unit_takes_three_cycles() {
        let mut unit = FunctionalUnit::new(UnitKind::Multiply, 4096);
        let (cycles, completion) = run_to_completion(&mut unit, ready_latch("MUL,R1,R2,R3", &[6, 7]));
        assert_eq!(cycles, 3);
        assert_eq!(completion, Completion::Register { rob_seq: 7, phys_reg: 20, value: 42 });
    }

    #[test]
    fn test_multiply_unit_is_pipelined() {
        let mut unit = FunctionalUnit::new(UnitKind::Multiply, 4096);
        unit.accept(ready_latch("MUL,R1,R2,R3", &[2, 3]));
        assert!(unit.do_cycle().is_none());
        assert!(unit.can_accept());
        unit.accept(ready_latch("MUL,R1,R2,R3", &[4, 4]));

        let occupied = unit.stages().filter(|(_, latch)| latch.is_some()).count();
        assert_eq!(occupied, 2);
        assert_eq!(unit.depth(), 3);

        assert!(unit.do_cycle().is_none());
        assert!(matches!(unit.do_cycle(), Some((_, Completion::Register { value: 6, .. }))));
        assert!(matches!(unit.do_cycle(), Some((_, Completion::Register { value: 16, .. }))));
    }

    #[test]
    fn test_full_unit_keeps_moving() {
        let mut unit = FunctionalUnit::new(UnitKind::Multiply, 4096);
        let mut values = Vec::new();
        for i in 1..=6 {
            unit.accept(ready_latch("MUL,R1,R2,R3", &[i, 10]));
            if let Some((_, Completion::Register { value, .. })) = unit.do_cycle() {
                values.push(value);
            }
            assert!(unit.can_accept());
        }
        assert_eq!(unit.stages().filter(|(_, l)| l.is_some()).count(), 2);
        assert_eq!(values, vec![10, 20, 30, 40]);
    }

    #[rstest]
    #[case("BZ,#8", 0, true, 4008)]
    #[case("BZ,#8", 3, false, 4004)]
    #[case("BNZ,#-8", 3, true, 3992)]
    #[case("BNZ,#-8", 0, false, 4004)]
    #[case("JUMP,R1,#4", 4100, true, 4104)]
    fn test_branch_unit(#[case] src: &str, #[case] value: WordType, #[case] taken: bool, #[case] target: WordType) {
        let mut unit = FunctionalUnit::new(UnitKind::Branch, 4096);
        let (cycles, completion) = run_to_completion(&mut unit, ready_latch(src, &[value]));
        assert_eq!(cycles, 1);
        assert_eq!(completion, Completion::Branch { rob_seq: 7, taken, target });
    }

    #[rstest]
    #[case("LOAD,R1,R2,#4", &[10], Completion::Address { rob_seq: 7, address: 14, store_value: None })]
    #[case("LDR,R1,R2,R3", &[10, 20], Completion::Address { rob_seq: 7, address: 30, store_value: None })]
    #[case("STORE,R1,R2,#1", &[99, 5], Completion::Address { rob_seq: 7, address: 6, store_value: Some(99) })]
    #[case("STR,R1,R2,R3", &[99, 5, 6], Completion::Address { rob_seq: 7, address: 11, store_value: Some(99) })]
    #[case("LOAD,R1,R2,#0", &[4096], Completion::Fault { rob_seq: 7, address: 4096 })]
    #[case("STORE,R1,R2,#-1", &[1, 0], Completion::Fault { rob_seq: 7, address: -1 })]
    fn test_memory_unit(#[case] src: &str, #[case] values: &[WordType], #[case] expected: Completion) {
        let mut unit = FunctionalUnit::new(UnitKind::Memory, 4096);
        let (cycles, completion) = run_to_completion(&mut unit, ready_latch(src, values));
        assert_eq!(cycles, 1);
        assert_eq!(completion, expected);
    }

    #[test]
    fn test_result_is_kept_in_latch() {
        let mut unit = FunctionalUnit::new(UnitKind::Memory, 4096);
        unit.accept(ready_latch("LOAD,R1,R2,#4", &[10]));
        assert!(unit.stages().all(|(_, latch)| latch.map_or(true, |l| l.busy)));

        let (latch, _) = unit.do_cycle().unwrap();
        assert_eq!(latch.mem_address, Some(14));
        assert!(!latch.busy);

        let mut unit = FunctionalUnit::new(UnitKind::Integer, 4096);
        unit.accept(ready_latch("ADDL,R1,R2,#1", &[41]));
        unit.do_cycle();
        let (latch, _) = unit.do_cycle().unwrap();
        assert_eq!(latch.buffer, 42);
    }

    #[test]
    fn test_flush_younger_than() {
        let mut unit = FunctionalUnit::new(UnitKind::Integer, 4096);
        let mut older = ready_latch("MOVC,R1,#1", &[]);
        older.rob_seq = 2;
        unit.accept(older);
        unit.do_cycle();

        let mut younger = ready_latch("MOVC,R1,#2", &[]);
        younger.rob_seq = 3;
        unit.accept(younger);

        unit.flush_younger_than(2);
        assert_eq!(unit.stages().filter(|(_, l)| l.is_some()).count(), 1);
        assert!(matches!(unit.do_cycle(), Some((_, Completion::Register { value: 1, .. }))));
    }
}
