//! The compile seam handed to hosts.
//!
//! The parser is an external collaborator and may hand over a tree still
//! containing error placeholder nodes. Codegen treats those as engine
//! defects, so hosts run `check_program` first: every placeholder becomes a
//! diagnostic, and `compile_checked` only lowers a clean tree.

use std::rc::Rc;

use quill_syntax::{Diagnostic, Span};

use crate::ast::*;
use crate::astgen::compile_program;
use crate::executable::Executable;

pub fn check_program(program: &Program) -> Vec<Diagnostic> {
    let mut spans = Vec::new();
    for stmt in &program.body {
        check_stmt(stmt, &mut spans);
    }
    spans
        .into_iter()
        .map(|span| Diagnostic::error("tree contains a parse-error node", Some(span)).with_code("Q0001"))
        .collect()
}

/// Compile a host-supplied tree, refusing one the parser gave up on.
pub fn compile_checked(program: &Program) -> Result<Rc<Executable>, Vec<Diagnostic>> {
    let diagnostics = check_program(program);
    if diagnostics.is_empty() {
        Ok(compile_program(program))
    } else {
        Err(diagnostics)
    }
}

fn check_stmt(stmt: &Stmt, out: &mut Vec<Span>) {
    match stmt {
        Stmt::Expr(expr) | Stmt::Throw(expr) => check_expr(expr, out),
        Stmt::Decl(decl) => check_var_decl(decl, out),
        Stmt::Block(stmts) => check_stmts(stmts, out),
        Stmt::If(stmt) => {
            check_expr(&stmt.test, out);
            check_stmts(&stmt.consequent, out);
            if let Some(alternate) = &stmt.alternate {
                check_stmts(alternate, out);
            }
        }
        Stmt::While(stmt) | Stmt::DoWhile(stmt) => {
            check_expr(&stmt.test, out);
            check_stmts(&stmt.body, out);
        }
        Stmt::For(stmt) => {
            match &stmt.init {
                Some(ForInit::Decl(decl)) => check_var_decl(decl, out),
                Some(ForInit::Expr(expr)) => check_expr(expr, out),
                None => {}
            }
            if let Some(test) = &stmt.test {
                check_expr(test, out);
            }
            if let Some(update) = &stmt.update {
                check_expr(update, out);
            }
            check_stmts(&stmt.body, out);
        }
        Stmt::ForIn(stmt) => {
            check_for_target(&stmt.target, out);
            check_expr(&stmt.object, out);
            check_stmts(&stmt.body, out);
        }
        Stmt::ForOf(stmt) => {
            check_for_target(&stmt.target, out);
            check_expr(&stmt.iterable, out);
            check_stmts(&stmt.body, out);
        }
        Stmt::Switch(stmt) => {
            check_expr(&stmt.discriminant, out);
            for case in &stmt.cases {
                if let Some(test) = &case.test {
                    check_expr(test, out);
                }
                check_stmts(&case.body, out);
            }
        }
        Stmt::Labelled(stmt) => check_stmt(&stmt.body, out),
        Stmt::Return(argument) => {
            if let Some(expr) = argument {
                check_expr(expr, out);
            }
        }
        Stmt::Try(stmt) => {
            check_stmts(&stmt.block, out);
            if let Some(handler) = &stmt.handler {
                if let Some(parameter) = &handler.parameter {
                    check_binding_target(parameter, out);
                }
                check_stmts(&handler.body, out);
            }
            if let Some(finalizer) = &stmt.finalizer {
                check_stmts(finalizer, out);
            }
        }
        Stmt::FunctionDecl(node) => check_function(node, out),
        Stmt::ClassDecl(node) => check_class(node, out),
        Stmt::Break(_) | Stmt::Continue(_) | Stmt::Empty => {}
        Stmt::Error(span) => out.push(*span),
    }
}

fn check_stmts(stmts: &[Stmt], out: &mut Vec<Span>) {
    for stmt in stmts {
        check_stmt(stmt, out);
    }
}

fn check_expr(expr: &Expr, out: &mut Vec<Span>) {
    match expr {
        Expr::Ident(_)
        | Expr::Number(_)
        | Expr::Str(_)
        | Expr::Bool(_)
        | Expr::Null
        | Expr::Undefined
        | Expr::This => {}
        Expr::Array(elements) => {
            for element in elements.iter().flatten() {
                check_expr(element, out);
            }
        }
        Expr::Object(properties) => {
            for property in properties.iter() {
                check_expr(&property.value, out);
            }
        }
        Expr::Function(node) => check_function(node, out),
        Expr::Class(node) => check_class(node, out),
        Expr::Unary { operand, .. } => check_expr(operand, out),
        Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => {
            check_expr(lhs, out);
            check_expr(rhs, out);
        }
        Expr::Conditional { test, consequent, alternate } => {
            check_expr(test, out);
            check_expr(consequent, out);
            check_expr(alternate, out);
        }
        Expr::Assign { target, value, .. } => {
            check_expr(target, out);
            check_expr(value, out);
        }
        Expr::Update { target, .. } => check_expr(target, out),
        Expr::Member(member) => {
            check_expr(&member.object, out);
            if let MemberKey::Index(index) = &member.key {
                check_expr(index, out);
            }
        }
        Expr::Call(call) => {
            check_expr(&call.callee, out);
            for arg in &call.args {
                check_expr(arg, out);
            }
        }
        Expr::New(new) => {
            check_expr(&new.callee, out);
            for arg in &new.args {
                check_expr(arg, out);
            }
        }
        Expr::Yield { argument, .. } => {
            if let Some(argument) = argument {
                check_expr(argument, out);
            }
        }
        Expr::Await(argument) => check_expr(argument, out),
        Expr::Error(span) => out.push(*span),
    }
}

fn check_var_decl(decl: &VarDecl, out: &mut Vec<Span>) {
    for declarator in &decl.declarators {
        check_binding_target(&declarator.target, out);
        if let Some(init) = &declarator.init {
            check_expr(init, out);
        }
    }
}

fn check_binding_target(target: &BindingTarget, out: &mut Vec<Span>) {
    match target {
        BindingTarget::Ident(_) => {}
        BindingTarget::Pattern(pattern) => match &**pattern {
            Pattern::Array(elements) => {
                for element in elements.iter() {
                    if let Some(target) = &element.target {
                        check_binding_target(target, out);
                    }
                    if let Some(default) = &element.default {
                        check_expr(default, out);
                    }
                }
            }
            Pattern::Object(properties) => {
                for property in properties.iter() {
                    check_binding_target(&property.target, out);
                    if let Some(default) = &property.default {
                        check_expr(default, out);
                    }
                }
            }
        },
    }
}

fn check_for_target(target: &ForTarget, out: &mut Vec<Span>) {
    match target {
        ForTarget::Decl { target, .. } => check_binding_target(target, out),
        ForTarget::Assign(expr) => check_expr(expr, out),
    }
}

fn check_function(node: &FunctionNode, out: &mut Vec<Span>) {
    for param in &node.params {
        if let Some(default) = &param.default {
            check_expr(default, out);
        }
    }
    check_stmts(&node.body, out);
}

fn check_class(node: &ClassNode, out: &mut Vec<Span>) {
    if let Some(superclass) = &node.superclass {
        check_expr(superclass, out);
    }
    for member in &node.members {
        if let Some(function) = &member.function {
            check_function(function, out);
        }
        if let Some(init) = &member.field_init {
            check_expr(init, out);
        }
    }
}
