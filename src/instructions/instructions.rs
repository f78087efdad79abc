use std::fmt;

use crate::instructions::instructions::Operand::{Immediate, Register};

pub type RegisterType = u8;
pub type PhysRegType = u16;
pub type WordType = i32;

/// The number of architectural registers (R0..R15).
pub const ARCH_REG_COUNT: u8 = 16;
// pseudo register renamed together with every destination; BZ and BNZ read it.
pub const ZERO_FLAG: RegisterType = ARCH_REG_COUNT;
pub const CODE_BASE: WordType = 4000;
pub const INSTR_WIDTH: WordType = 4;
pub const MAX_SOURCE_COUNT: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Opcode {
    MOVC,
    ADD,
    SUB,
    AND,
    OR,
    EXOR,
    MUL,
    ADDL,
    SUBL,
    LOAD,
    LDR,
    STORE,
    STR,
    BZ,
    BNZ,
    JUMP,
    HALT,
    NOP,
}

/// The class of functional unit an opcode executes on.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum UnitKind {
    Integer,
    Multiply,
    Branch,
    Memory,
}

impl Opcode {
    pub fn unit_kind(self) -> Option<UnitKind> {
        match self {
            Opcode::MOVC |
            Opcode::ADD |
            Opcode::SUB |
            Opcode::AND |
            Opcode::OR |
            Opcode::EXOR |
            Opcode::ADDL |
            Opcode::SUBL => Some(UnitKind::Integer),
            Opcode::MUL => Some(UnitKind::Multiply),
            Opcode::BZ |
            Opcode::BNZ |
            Opcode::JUMP => Some(UnitKind::Branch),
            Opcode::LOAD |
            Opcode::LDR |
            Opcode::STORE |
            Opcode::STR => Some(UnitKind::Memory),
            Opcode::HALT |
            Opcode::NOP => None,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::BZ | Opcode::BNZ | Opcode::JUMP)
    }

    pub fn is_load(self) -> bool {
        matches!(self, Opcode::LOAD | Opcode::LDR)
    }

    pub fn is_store(self) -> bool {
        matches!(self, Opcode::STORE | Opcode::STR)
    }

    pub fn is_memory(self) -> bool {
        self.is_load() || self.is_store()
    }
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::MOVC => "MOVC",
        Opcode::ADD => "ADD",
        Opcode::SUB => "SUB",
        Opcode::AND => "AND",
        Opcode::OR => "OR",
        Opcode::EXOR => "EX-OR",
        Opcode::MUL => "MUL",
        Opcode::ADDL => "ADDL",
        Opcode::SUBL => "SUBL",
        Opcode::LOAD => "LOAD",
        Opcode::LDR => "LDR",
        Opcode::STORE => "STORE",
        Opcode::STR => "STR",
        Opcode::BZ => "BZ",
        Opcode::BNZ => "BNZ",
        Opcode::JUMP => "JUMP",
        Opcode::HALT => "HALT",
        Opcode::NOP => "NOP",
    }
}

pub fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "MOVC" => Some(Opcode::MOVC),
        "ADD" => Some(Opcode::ADD),
        "SUB" => Some(Opcode::SUB),
        "AND" => Some(Opcode::AND),
        "OR" => Some(Opcode::OR),
        "EX-OR" | "EXOR" | "XOR" => Some(Opcode::EXOR),
        "MUL" => Some(Opcode::MUL),
        "ADDL" => Some(Opcode::ADDL),
        "SUBL" => Some(Opcode::SUBL),
        "LOAD" => Some(Opcode::LOAD),
        "LDR" => Some(Opcode::LDR),
        "STORE" => Some(Opcode::STORE),
        "STR" => Some(Opcode::STR),
        "BZ" => Some(Opcode::BZ),
        "BNZ" => Some(Opcode::BNZ),
        "JUMP" => Some(Opcode::JUMP),
        "HALT" => Some(Opcode::HALT),
        "NOP" => Some(Opcode::NOP),
        _ => None,
    }
}

/// An operand as it appears in the program text.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operand {
    Register(RegisterType),
    Immediate(WordType),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register(reg) => write!(f, "R{}", reg),
            Immediate(val) => write!(f, "#{}", val),
        }
    }
}

/// A decoded static instruction. Immutable once loaded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Instr {
    pub opcode: Opcode,
    pub rd: Option<RegisterType>,
    pub rs1: Option<RegisterType>,
    pub rs2: Option<RegisterType>,
    pub rs3: Option<RegisterType>,
    pub imm: WordType,
}

impl Instr {
    pub fn new(opcode: Opcode) -> Instr {
        Instr { opcode, rd: None, rs1: None, rs2: None, rs3: None, imm: 0 }
    }

    // the register sources in operand-slot order. For STORE/STR the first
    // slot is the value to store, the others form the address.
    pub fn sources(&self) -> [Option<RegisterType>; MAX_SOURCE_COUNT] {
        match self.opcode {
            // the zero flag is renamed like a register
            Opcode::BZ | Opcode::BNZ => [Some(ZERO_FLAG), None, None],
            _ => [self.rs1, self.rs2, self.rs3],
        }
    }

    pub fn writes_register(&self) -> bool {
        self.rd.is_some()
    }
}

fn reg_name(reg: Option<RegisterType>) -> String {
    match reg {
        Some(r) if r == ZERO_FLAG => "Z".to_string(),
        Some(r) => format!("R{}", r),
        None => "R?".to_string(),
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = mnemonic(self.opcode);
        match self.opcode {
            Opcode::MOVC =>
                write!(f, "{},{},#{}", name, reg_name(self.rd), self.imm),
            Opcode::ADD |
            Opcode::SUB |
            Opcode::AND |
            Opcode::OR |
            Opcode::EXOR |
            Opcode::MUL |
            Opcode::LDR =>
                write!(f, "{},{},{},{}", name, reg_name(self.rd), reg_name(self.rs1), reg_name(self.rs2)),
            Opcode::ADDL |
            Opcode::SUBL |
            Opcode::LOAD =>
                write!(f, "{},{},{},#{}", name, reg_name(self.rd), reg_name(self.rs1), self.imm),
            Opcode::STORE =>
                write!(f, "{},{},{},#{}", name, reg_name(self.rs1), reg_name(self.rs2), self.imm),
            Opcode::STR =>
                write!(f, "{},{},{},{}", name, reg_name(self.rs1), reg_name(self.rs2), reg_name(self.rs3)),
            Opcode::BZ |
            Opcode::BNZ =>
                write!(f, "{},#{}", name, self.imm),
            Opcode::JUMP =>
                write!(f, "{},{},#{}", name, reg_name(self.rs1), self.imm),
            Opcode::HALT |
            Opcode::NOP =>
                write!(f, "{}", name),
        }
    }
}

fn expect_register(opcode: Opcode, operands: &[Operand], index: usize) -> Result<RegisterType, String> {
    match operands[index] {
        Register(reg) => Ok(reg),
        Immediate(_) => Err(format!("{} expects a register as argument {}", mnemonic(opcode), index + 1)),
    }
}

fn expect_immediate(opcode: Opcode, operands: &[Operand], index: usize) -> Result<WordType, String> {
    match operands[index] {
        Immediate(value) => Ok(value),
        Register(_) => Err(format!("{} expects an immediate as argument {}", mnemonic(opcode), index + 1)),
    }
}

pub(crate) fn create_instr(opcode: Opcode, operands: &[Operand]) -> Result<Instr, String> {
    let expected = match opcode {
        Opcode::HALT | Opcode::NOP => 0,
        Opcode::BZ | Opcode::BNZ => 1,
        Opcode::MOVC | Opcode::JUMP => 2,
        _ => 3,
    };

    if operands.len() != expected {
        return Err(format!("{} expects {} arguments, but {} are provided",
                           mnemonic(opcode), expected, operands.len()));
    }

    let mut instr = Instr::new(opcode);
    match opcode {
        Opcode::MOVC => {
            instr.rd = Some(expect_register(opcode, operands, 0)?);
            instr.imm = expect_immediate(opcode, operands, 1)?;
        }
        Opcode::ADD |
        Opcode::SUB |
        Opcode::AND |
        Opcode::OR |
        Opcode::EXOR |
        Opcode::MUL |
        Opcode::LDR => {
            instr.rd = Some(expect_register(opcode, operands, 0)?);
            instr.rs1 = Some(expect_register(opcode, operands, 1)?);
            instr.rs2 = Some(expect_register(opcode, operands, 2)?);
        }
        Opcode::ADDL |
        Opcode::SUBL |
        Opcode::LOAD => {
            instr.rd = Some(expect_register(opcode, operands, 0)?);
            instr.rs1 = Some(expect_register(opcode, operands, 1)?);
            instr.imm = expect_immediate(opcode, operands, 2)?;
        }
        Opcode::STORE => {
            instr.rs1 = Some(expect_register(opcode, operands, 0)?);
            instr.rs2 = Some(expect_register(opcode, operands, 1)?);
            instr.imm = expect_immediate(opcode, operands, 2)?;
        }
        Opcode::STR => {
            instr.rs1 = Some(expect_register(opcode, operands, 0)?);
            instr.rs2 = Some(expect_register(opcode, operands, 1)?);
            instr.rs3 = Some(expect_register(opcode, operands, 2)?);
        }
        Opcode::BZ |
        Opcode::BNZ => {
            instr.imm = expect_immediate(opcode, operands, 0)?;
        }
        Opcode::JUMP => {
            instr.rs1 = Some(expect_register(opcode, operands, 0)?);
            instr.imm = expect_immediate(opcode, operands, 1)?;
        }
        Opcode::HALT |
        Opcode::NOP => {}
    }

    Ok(instr)
}

/// The instruction store: the static program image, addressed by pc.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub code: Vec<Instr>,
}

impl Program {
    pub fn new(code: Vec<Instr>) -> Program {
        Program { code }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn index_of(&self, pc: WordType) -> Option<usize> {
        if pc < CODE_BASE || (pc - CODE_BASE) % INSTR_WIDTH != 0 {
            return None;
        }

        let index = ((pc - CODE_BASE) / INSTR_WIDTH) as usize;
        if index < self.code.len() { Some(index) } else { None }
    }

    pub fn get_instr(&self, pc: WordType) -> Option<&Instr> {
        self.index_of(pc).map(|index| &self.code[index])
    }

    pub fn pc_of(index: usize) -> WordType {
        CODE_BASE + index as WordType * INSTR_WIDTH
    }
}
