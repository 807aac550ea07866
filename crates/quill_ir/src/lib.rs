//! Bytecode half of the quill engine: the input AST, the instruction set and
//! operand model, the basic-block builder, the AST → bytecode generator, and
//! the linked executable the interpreter consumes.

pub mod ast;
mod astgen;
mod block;
mod cache;
mod executable;
mod frontend;
mod generator;
mod instruction;
mod numeric;
mod operand;

pub use astgen::{compile_function, compile_program};
pub use frontend::{check_program, compile_checked};
pub use block::BasicBlock;
pub use cache::{CacheTables, EnvironmentCache, GlobalCache, PropertyCache};
pub use executable::{
    ClassBlueprint, ClassMemberDescriptor, Executable, FunctionKind, FunctionTemplate,
    HandlerRange, LocalVariable, MemberKind, MemberValue,
};
pub use generator::{
    BlockBoundary, FinallyContext, Generator, COMPLETION_NORMAL, COMPLETION_RETURN,
    COMPLETION_THROW, FIRST_JUMP_INDEX,
};
pub use instruction::{
    BindingMode, CacheIndex, CloseCompletion, Constant, IdentifierIndex, Instruction,
    IteratorHint, PropertyKind, ResumeMode, StringIndex,
};
pub use numeric::{to_int32, to_uint32};
pub use operand::{Label, Operand, Register};
