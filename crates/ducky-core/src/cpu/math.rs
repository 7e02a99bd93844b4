//! 64-bit math coprocessor.
//!
//! Operates on its own typed operand stack, separate from the main data
//! stack. Values are either machine words or 64-bit longs; popping a
//! mismatched type is a coprocessor fault, never a silent coercion.

use serde::{Deserialize, Serialize};

use crate::cpu::insn::CopInstr;
use crate::reg::RegisterFile;
use crate::trap::{CopFault, Trap};

/// Maximum operand-stack depth.
pub const STACK_DEPTH: usize = 16;

/// One operand-stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Word(u32),
    Long(i64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MathCoprocessor {
    stack: Vec<Value>,
}

impl MathCoprocessor {
    pub fn new() -> Self {
        MathCoprocessor::default()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn push(&mut self, value: Value) -> Result<(), Trap> {
        if self.stack.len() >= STACK_DEPTH {
            return Err(Trap::CoprocessorFault(CopFault::StackOverflow));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Trap> {
        self.stack
            .pop()
            .ok_or(Trap::CoprocessorFault(CopFault::StackUnderflow))
    }

    fn pop_word(&mut self) -> Result<u32, Trap> {
        match self.pop()? {
            Value::Word(w) => Ok(w),
            long @ Value::Long(_) => {
                self.stack.push(long);
                Err(Trap::CoprocessorFault(CopFault::TypeMismatch))
            }
        }
    }

    fn pop_long(&mut self) -> Result<i64, Trap> {
        match self.pop()? {
            Value::Long(l) => Ok(l),
            word @ Value::Word(_) => {
                self.stack.push(word);
                Err(Trap::CoprocessorFault(CopFault::TypeMismatch))
            }
        }
    }

    fn binary_long(&mut self, f: impl Fn(i64, i64) -> Result<i64, Trap>) -> Result<(), Trap> {
        let b = self.pop_long()?;
        let a = self.pop_long()?;
        let result = f(a, b)?;
        self.push(Value::Long(result))
    }

    /// Execute one coprocessor operation against the register file.
    pub fn execute(&mut self, regs: &mut RegisterFile, instr: CopInstr) -> Result<(), Trap> {
        match instr {
            CopInstr::PushW { r } => self.push(Value::Word(regs.read(r))),
            CopInstr::PopW { r } => {
                let word = self.pop_word()?;
                regs.write(r, word);
                Ok(())
            }
            CopInstr::Itol => {
                let word = self.pop_word()?;
                self.push(Value::Long(i64::from(word as i32)))
            }
            CopInstr::Utol => {
                let word = self.pop_word()?;
                self.push(Value::Long(i64::from(word)))
            }
            CopInstr::Ltoi { r } => {
                let long = self.pop_long()?;
                regs.write(r, long as u32);
                Ok(())
            }
            CopInstr::Ltoii { lo, hi } => {
                let long = self.pop_long()?;
                regs.write(lo, long as u32);
                regs.write(hi, (long as u64 >> 32) as u32);
                Ok(())
            }
            CopInstr::Dupl => {
                let top = self.pop()?;
                self.push(top)?;
                self.push(top)
            }
            CopInstr::Dropl => self.pop().map(|_| ()),
            CopInstr::Swpl => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)
            }
            CopInstr::AddL => self.binary_long(|a, b| Ok(a.wrapping_add(b))),
            CopInstr::SubL => self.binary_long(|a, b| Ok(a.wrapping_sub(b))),
            CopInstr::MulL => self.binary_long(|a, b| Ok(a.wrapping_mul(b))),
            CopInstr::DivL => self.binary_long(|a, b| {
                if b == 0 {
                    Err(Trap::DivisionByZero)
                } else {
                    Ok(a.wrapping_div(b))
                }
            }),
            CopInstr::ModL => self.binary_long(|a, b| {
                if b == 0 {
                    Err(Trap::DivisionByZero)
                } else {
                    Ok(a.wrapping_rem(b))
                }
            }),
        }
    }
}
