//! Shared source positions and diagnostics for the quill engine.

mod diagnostic;
mod span;

pub use diagnostic::{Diagnostic, Label, Severity};
pub use span::{ByteIndex, Span};
