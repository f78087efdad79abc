use std::fs;

use regex::Regex;
use thiserror::Error;

use crate::instructions::instructions::{ARCH_REG_COUNT, create_instr, get_opcode, Instr, Operand, Program, RegisterType, WordType};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read '{path}': {source}")]
    IOError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: unknown opcode '{mnemonic}'")]
    UnknownOpcode { line: usize, mnemonic: String },
    #[error("line {line}: {msg}")]
    ParseError { line: usize, msg: String },
    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

struct Loader {
    separator: Regex,
    register: Regex,
    immediate: Regex,
    code: Vec<Instr>,
}

impl Loader {
    fn new() -> Result<Loader, LoadError> {
        Ok(Loader {
            separator: Regex::new(r"[,\s]+")?,
            register: Regex::new(r"^(?i)R(\d+)$")?,
            immediate: Regex::new(r"^#([+-]?\d+)$")?,
            code: Vec::new(),
        })
    }

    fn load(mut self, src: &str) -> Result<Program, LoadError> {
        for (line_index, raw_line) in src.lines().enumerate() {
            let line = line_index + 1;
            // everything after ';' is a comment
            let text = match raw_line.find(';') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            let instr = self.parse_instr(line, text)?;
            self.code.push(instr);
        }

        Ok(Program::new(self.code))
    }

    fn parse_instr(&self, line: usize, text: &str) -> Result<Instr, LoadError> {
        let mut tokens = self.separator.split(text).filter(|t| !t.is_empty());

        let mnemonic = match tokens.next() {
            Some(token) => token,
            None => return Err(LoadError::ParseError { line, msg: "missing opcode".to_string() }),
        };

        let opcode = get_opcode(mnemonic)
            .ok_or_else(|| LoadError::UnknownOpcode { line, mnemonic: mnemonic.to_string() })?;

        let mut operands = Vec::new();
        for token in tokens {
            operands.push(self.parse_operand(line, token)?);
        }

        create_instr(opcode, &operands).map_err(|msg| LoadError::ParseError { line, msg })
    }

    fn parse_operand(&self, line: usize, token: &str) -> Result<Operand, LoadError> {
        if let Some(captures) = self.register.captures(token) {
            let reg: u32 = captures[1].parse()
                .map_err(|_| LoadError::ParseError { line, msg: format!("illegal register '{}'", token) })?;
            if reg >= ARCH_REG_COUNT as u32 {
                return Err(LoadError::ParseError { line, msg: format!("illegal register '{}'", token) });
            }
            return Ok(Operand::Register(reg as RegisterType));
        }

        if let Some(captures) = self.immediate.captures(token) {
            let value: WordType = captures[1].parse()
                .map_err(|_| LoadError::ParseError { line, msg: format!("immediate '{}' out of range", token) })?;
            return Ok(Operand::Immediate(value));
        }

        Err(LoadError::ParseError { line, msg: format!("unrecognized operand '{}'", token) })
    }
}

pub fn load_from_string(src: &str) -> Result<Program, LoadError> {
    Loader::new()?.load(src)
}

pub fn load(path: &str) -> Result<Program, LoadError> {
    let src = fs::read_to_string(path)
        .map_err(|source| LoadError::IOError { path: path.to_string(), source })?;
    load_from_string(&src)
}
