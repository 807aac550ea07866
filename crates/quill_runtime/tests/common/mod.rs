//! Shared helpers for building input trees and driving programs.
//!
//! The parser is an external collaborator, so tests construct the resolved
//! syntax tree directly: identifiers that should live in frame slots carry
//! their local index, everything else goes through the environment chain.

#![allow(dead_code)]

use quill_ir::ast::*;
use quill_ir::{compile_program, FunctionKind};
use quill_runtime::{Runtime, Value};

pub fn num(n: f64) -> Expr {
    Expr::Number(n)
}

pub fn text(s: &str) -> Expr {
    Expr::Str(s.to_string())
}

pub fn boolean(b: bool) -> Expr {
    Expr::Bool(b)
}

pub fn global(name: &str) -> Expr {
    Expr::Ident(Box::new(Ident::new(name)))
}

pub fn local(name: &str, index: u32) -> Expr {
    Expr::Ident(Box::new(Ident::local(name, index)))
}

pub fn argument(name: &str, index: u32) -> Expr {
    Expr::Ident(Box::new(Ident::argument(name, index)))
}

pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
}

pub fn logical(op: LogicalOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Logical { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
}

pub fn assign(target: Expr, value: Expr) -> Expr {
    Expr::Assign { op: AssignOp::Assign, target: Box::new(target), value: Box::new(value) }
}

pub fn member(object: Expr, name: &str) -> Expr {
    Expr::Member(Box::new(MemberExpr {
        object,
        key: MemberKey::Prop(name.to_string()),
        optional: false,
    }))
}

pub fn index(object: Expr, key: Expr) -> Expr {
    Expr::Member(Box::new(MemberExpr { object, key: MemberKey::Index(key), optional: false }))
}

pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call(Box::new(CallExpr { callee, args: args.into_boxed_slice(), optional: false }))
}

pub fn array(elements: Vec<Expr>) -> Expr {
    Expr::Array(elements.into_iter().map(Some).collect())
}

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::Expr(expr)
}

pub fn let_ident(name: &str, slot: u32, init: Expr) -> Stmt {
    Stmt::Decl(Box::new(VarDecl {
        kind: DeclKind::Let,
        declarators: Box::new([Declarator {
            target: BindingTarget::Ident(Box::new(Ident::local(name, slot))),
            init: Some(init),
        }]),
    }))
}

pub fn let_pattern(pattern: Pattern, init: Expr) -> Stmt {
    Stmt::Decl(Box::new(VarDecl {
        kind: DeclKind::Let,
        declarators: Box::new([Declarator {
            target: BindingTarget::Pattern(Box::new(pattern)),
            init: Some(init),
        }]),
    }))
}

pub fn lexical(name: &str) -> LocalDecl {
    LocalDecl { name: name.to_string(), lexical: true }
}

pub fn function(
    name: &str,
    kind: FunctionKind,
    params: Vec<&str>,
    locals: Vec<LocalDecl>,
    body: Vec<Stmt>,
) -> FunctionNode {
    FunctionNode {
        name: Some(name.to_string()),
        kind,
        params: params
            .into_iter()
            .map(|p| Param { name: p.to_string(), default: None })
            .collect(),
        body: body.into_boxed_slice(),
        locals: locals.into_boxed_slice(),
    }
}

pub fn program(locals: Vec<LocalDecl>, body: Vec<Stmt>) -> Program {
    Program { body: body.into_boxed_slice(), locals: locals.into_boxed_slice() }
}

fn sink_native(rt: &mut Runtime, _this: Value, args: &[Value]) -> Result<Value, Value> {
    rt.sink.extend_from_slice(args);
    Ok(Value::UNDEFINED)
}

/// A runtime with a `sink(...)` global that records its arguments.
pub fn runtime_with_sink() -> Runtime {
    let mut rt = Runtime::new();
    let sink = rt.new_native_function("sink", sink_native);
    rt.define_global("sink", sink);
    rt
}

pub fn run(rt: &mut Runtime, program: &Program) -> Result<Value, Value> {
    let executable = compile_program(program);
    rt.run_program(&executable)
}

pub fn run_ok(rt: &mut Runtime, program: &Program) -> Value {
    match run(rt, program) {
        Ok(value) => value,
        Err(error) => {
            let message = rt.to_string_value(error).unwrap_or_default();
            panic!("program threw: {message}");
        }
    }
}

pub fn sink_numbers(rt: &Runtime) -> Vec<f64> {
    rt.sink.iter().map(|v| v.as_number()).collect()
}

pub fn sink_strings(rt: &mut Runtime) -> Vec<String> {
    let values = rt.sink.clone();
    values
        .into_iter()
        .map(|v| rt.to_string_value(v).unwrap_or_default())
        .collect()
}
