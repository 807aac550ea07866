//! Operands and the shared frame index space.
//!
//! Registers, constants, locals and arguments all live in one flat per-frame
//! slot array, laid out as `[registers | constants | locals | arguments]`.
//! An operand is only meaningful relative to the executable that produced it.

use std::fmt;

/// A bytecode register index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Register(pub u32);

impl Register {
    pub const ACCUMULATOR: Register = Register(0);
    pub const EXCEPTION: Register = Register(1);
    pub const THIS_VALUE: Register = Register(2);
    pub const RETURN_VALUE: Register = Register(3);

    /// Registers below this index are reserved by the interpreter.
    pub const RESERVED_COUNT: u32 = 4;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Register(u32),
    Local(u32),
    Argument(u32),
    Constant(u32),
}

impl Operand {
    #[inline]
    pub fn is_constant(self) -> bool {
        matches!(self, Operand::Constant(_))
    }

    #[inline]
    pub fn is_register(self) -> bool {
        matches!(self, Operand::Register(_))
    }

    #[inline]
    pub fn index(self) -> u32 {
        match self {
            Operand::Register(i) | Operand::Local(i) | Operand::Argument(i) | Operand::Constant(i) => i,
        }
    }
}

impl From<Register> for Operand {
    fn from(r: Register) -> Self {
        Operand::Register(r.0)
    }
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(i) => write!(f, "reg{}", i),
            Operand::Local(i) => write!(f, "loc{}", i),
            Operand::Argument(i) => write!(f, "arg{}", i),
            Operand::Constant(i) => write!(f, "const{}", i),
        }
    }
}

/// A jump target. Before linking this holds a basic block index; linking
/// rewrites it in place to an absolute instruction offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_registers_are_distinct() {
        let all = [
            Register::ACCUMULATOR,
            Register::EXCEPTION,
            Register::THIS_VALUE,
            Register::RETURN_VALUE,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.0 < Register::RESERVED_COUNT);
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
