//! Program-level error messages.
//!
//! Errors raised by the interpreter are thrown string values built from
//! these constants, so tests and hosts can match on stable text.

pub mod messages {
    pub const NOT_A_FUNCTION: &str = "value is not a function";
    pub const NOT_A_CONSTRUCTOR: &str = "value is not a constructor";
    pub const NOT_AN_OBJECT: &str = "value is not an object";
    pub const NOT_ITERABLE: &str = "value is not iterable";
    pub const ITERATOR_RESULT_NOT_OBJECT: &str = "iterator result is not an object";
    pub const ITERATOR_NO_THROW_METHOD: &str = "iterator has no throw method";
    pub const NULLISH_PROPERTY_ACCESS: &str = "cannot read properties of a nullish value";
    pub const NULLISH_PROPERTY_WRITE: &str = "cannot set properties of a nullish value";
    pub const ASSIGNMENT_TO_CONSTANT: &str = "assignment to constant binding";
    pub const CALL_STACK_EXCEEDED: &str = "maximum call stack size exceeded";
    pub const ACTIVATION_ALREADY_RUNNING: &str = "activation is already running";
    pub const GENERATOR_FINISHED: &str = "generator has already finished";

    pub fn undefined_binding(name: &str) -> String {
        format!("'{name}' is not defined")
    }

    pub fn binding_not_initialized(name: &str) -> String {
        format!("cannot access '{name}' before initialization")
    }
}
