//! Quill runtime: NaN-boxed values, the garbage-collected heap, the
//! shape-based object model, environments, iterators, call frames, and the
//! bytecode dispatch loop with its inline caches.

pub mod errors;

mod env;
mod frame;
mod heap;
mod interpreter;
mod iterator;
mod object;
mod ops;
mod runtime;
mod value;

pub use env::{Binding, EnvRecord};
pub use frame::{ActivationState, Frame};
pub use heap::{Heap, ManagedObject, ObjectId};
pub use interpreter::RunResult;
pub use iterator::{IteratorImpl, IteratorRecord};
pub use object::{
    Accessor, ClassInfo, FastHashMap, FieldInit, FunctionObject, NativeFunction, PropertySlot,
    ScriptObject, Shape,
};
pub use ops::number_to_string;
pub use runtime::{ResumeKind, Runtime, RuntimeConfig};
pub use value::Value;

pub use quill_ir::{compile_function, compile_program};
