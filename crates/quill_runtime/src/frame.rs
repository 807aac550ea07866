//! Call frames.
//!
//! One flat slot array per activation laid out as
//! `[registers | constants | locals | arguments]`. Constants are copied in at
//! entry and never written afterwards; reserved registers hold the
//! accumulator, the pending exception, the cached `this`, and the return
//! value. A suspended activation keeps its boxed frame until it resumes or
//! is discarded; frames are never reused across activations.

use std::rc::Rc;

use quill_ir::{Constant, Executable, FunctionKind, Operand, Register};

use crate::runtime::Runtime;
use crate::value::Value;

pub struct Frame {
    pub executable: Rc<Executable>,
    pub slots: Box<[Value]>,
    pub lexical_environment: Value,
}

impl Frame {
    pub fn new(
        rt: &mut Runtime,
        executable: Rc<Executable>,
        environment: Value,
        this: Value,
        args: &[Value],
    ) -> Frame {
        let mut slots = vec![Value::UNDEFINED; executable.frame_size()].into_boxed_slice();
        slots[Register::EXCEPTION.0 as usize] = Value::EMPTY;
        slots[Register::THIS_VALUE.0 as usize] = this;
        slots[Register::RETURN_VALUE.0 as usize] = Value::EMPTY;

        let constants_base = executable.constants_base();
        for (index, constant) in executable.constants.iter().enumerate() {
            slots[constants_base + index] = rt.constant_to_value(&executable, constant);
        }

        let locals_base = executable.locals_base();
        for (index, local) in executable.locals.iter().enumerate() {
            slots[locals_base + index] = if local.lexical { Value::EMPTY } else { Value::UNDEFINED };
        }

        let arguments_base = executable.arguments_base();
        for index in 0..executable.argument_count as usize {
            slots[arguments_base + index] = args.get(index).copied().unwrap_or(Value::UNDEFINED);
        }

        Frame { executable, slots, lexical_environment: environment }
    }

    #[inline]
    fn slot_index(&self, operand: Operand) -> usize {
        match operand {
            Operand::Register(index) => index as usize,
            Operand::Constant(index) => self.executable.constants_base() + index as usize,
            Operand::Local(index) => self.executable.locals_base() + index as usize,
            Operand::Argument(index) => self.executable.arguments_base() + index as usize,
        }
    }

    #[inline]
    pub fn get(&self, operand: Operand) -> Value {
        self.slots[self.slot_index(operand)]
    }

    #[inline]
    pub fn set(&mut self, operand: Operand, value: Value) {
        debug_assert!(!operand.is_constant(), "constants are never written at runtime");
        let index = self.slot_index(operand);
        self.slots[index] = value;
    }

    #[inline]
    pub fn register(&self, register: Register) -> Value {
        self.slots[register.0 as usize]
    }

    #[inline]
    pub fn set_register(&mut self, register: Register, value: Value) {
        self.slots[register.0 as usize] = value;
    }
}

impl Runtime {
    pub(crate) fn constant_to_value(&mut self, executable: &Executable, constant: &Constant) -> Value {
        match constant {
            Constant::Undefined => Value::UNDEFINED,
            Constant::Null => Value::NULL,
            Constant::Bool(b) => Value::from_bool(*b),
            Constant::Number(n) => Value::number(*n),
            Constant::Str(index) => {
                let text = executable.string(*index).to_string();
                self.alloc_string(text)
            }
        }
    }
}

/// A suspended or running generator/async activation. The frame is taken out
/// while bytecode is executing so re-entry is detectable.
pub struct ActivationState {
    pub kind: FunctionKind,
    pub frame: Option<Box<Frame>>,
    pub resume_at: usize,
    pub started: bool,
    pub done: bool,
    /// Result recorded when the activation finished eagerly (an async body
    /// completing before its first suspension).
    pub result: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_ir::ast::{LocalDecl, Program};
    use quill_ir::compile_program;

    #[test]
    fn frame_initializes_reserved_and_local_slots() {
        let mut rt = Runtime::new();
        let program = Program {
            body: Box::new([]),
            locals: Box::new([
                LocalDecl { name: "a".into(), lexical: true },
                LocalDecl { name: "b".into(), lexical: false },
            ]),
        };
        let executable = compile_program(&program);
        let env = rt.global_environment;
        let frame = Frame::new(&mut rt, executable.clone(), env, Value::from_i64(5), &[]);

        assert_eq!(frame.register(Register::THIS_VALUE), Value::from_i64(5));
        assert!(frame.register(Register::EXCEPTION).is_empty());
        assert!(frame.get(Operand::Local(0)).is_empty(), "lexical local starts in TDZ");
        assert!(frame.get(Operand::Local(1)).is_undefined(), "var local starts undefined");
    }
}
