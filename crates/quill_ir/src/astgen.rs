//! AST → bytecode lowering, one function per node kind.
//!
//! Every lowering takes the generator state and an optional preferred
//! destination operand and returns the operand holding its value (or nothing
//! for value-less statements). Evaluation order is the source language's
//! left-to-right eager order throughout; anything an operand sequence reads
//! from a mutable slot is copied to a fresh register before later operands
//! are evaluated.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::ast::*;
use crate::executable::{
    ClassBlueprint, ClassMemberDescriptor, Executable, FunctionKind, FunctionTemplate,
    LocalVariable, MemberKind, MemberValue,
};
use crate::generator::{
    BlockBoundary, FinallyContext, Generator, COMPLETION_NORMAL, COMPLETION_RETURN,
    COMPLETION_THROW, FIRST_JUMP_INDEX,
};
use crate::instruction::{
    BindingMode, CloseCompletion, Instruction, IteratorHint, PropertyKind, ResumeMode,
};
use crate::numeric::{to_int32, to_uint32};
use crate::operand::{Label, Operand, Register};

/// Compile a top-level program. The executable finishes with an `End`
/// carrying the completion value of the last value-producing statement.
pub fn compile_program(program: &Program) -> Rc<Executable> {
    let locals = locals_from(&program.locals);
    let mut generator = Generator::new("<program>", FunctionKind::Normal, locals, 0);
    generator.mark_program();

    let completion = generator.allocate_register();
    let undefined = generator.add_undefined_constant();
    generator.emit_mov(completion, undefined);

    let bindings = collect_scoped_bindings(&program.body, &generator);
    for (name, immutable) in &bindings {
        let identifier = generator.intern_identifier(name);
        generator.emit(Instruction::CreateVariable { identifier, immutable: *immutable });
    }

    for stmt in &program.body {
        if let Some(value) = generator.compile_stmt(stmt) {
            if !generator.is_current_block_terminated() {
                generator.emit_mov(completion, value);
            }
        }
    }
    if !generator.is_current_block_terminated() {
        generator.emit(Instruction::End { value: completion });
    }
    Rc::new(generator.finish())
}

/// Compile a function node into a shareable template. Nested functions are
/// compiled eagerly the same way and registered with their outer executable.
pub fn compile_function(node: &FunctionNode) -> Rc<FunctionTemplate> {
    let locals = locals_from(&node.locals);
    let name = node.name.clone().unwrap_or_default();
    let mut generator = Generator::new(name.clone(), node.kind, locals, node.params.len() as u32);

    // Parameter defaults: a missing (undefined) argument evaluates its
    // default into the argument slot before the body runs.
    for (index, param) in node.params.iter().enumerate() {
        if let Some(default) = &param.default {
            let argument = generator.argument(index as u32);
            let default_block = generator.make_block();
            let continuation = generator.make_block();
            generator.emit(Instruction::JumpUndefined {
                src: argument,
                true_target: default_block,
                false_target: continuation,
            });
            generator.switch_to_block(default_block);
            let value = generator.compile_expr(default, None);
            generator.emit_mov(argument, value);
            generator.emit(Instruction::Jump { target: continuation });
            generator.switch_to_block(continuation);
        }
    }

    let bindings = collect_scoped_bindings(&node.body, &generator);
    for (binding_name, immutable) in &bindings {
        let identifier = generator.intern_identifier(binding_name);
        generator.emit(Instruction::CreateVariable { identifier, immutable: *immutable });
    }

    for stmt in &node.body {
        generator.compile_stmt(stmt);
    }
    if !generator.is_current_block_terminated() {
        let undefined = generator.add_undefined_constant();
        generator.emit_return(undefined);
    }

    let executable = Rc::new(generator.finish());
    Rc::new(FunctionTemplate {
        name,
        kind: node.kind,
        parameter_count: node.params.len() as u32,
        executable,
    })
}

fn locals_from(decls: &[LocalDecl]) -> Vec<LocalVariable> {
    decls
        .iter()
        .map(|decl| LocalVariable { name: decl.name.clone(), lexical: decl.lexical })
        .collect()
}

/// Wrap a non-literal field initializer in a zero-argument thunk so the
/// blueprint can point at a registered function template.
fn field_initializer_function(init: &Expr) -> FunctionNode {
    FunctionNode {
        name: None,
        kind: FunctionKind::Normal,
        params: Box::new([]),
        body: Box::new([Stmt::Return(Some(init.clone()))]),
        locals: Box::new([]),
    }
}

// ---- constant folding -----------------------------------------------------

/// A compile-time value produced by folding literal subtrees. Only
/// operations that cannot throw or observe side effects fold.
#[derive(Clone, Debug, PartialEq)]
enum Folded {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
}

impl Folded {
    fn is_truthy(&self) -> bool {
        match self {
            Folded::Number(n) => *n != 0.0 && !n.is_nan(),
            Folded::Str(s) => !s.is_empty(),
            Folded::Bool(b) => *b,
            Folded::Null | Folded::Undefined => false,
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Folded::Null | Folded::Undefined)
    }
}

fn fold_expr(expr: &Expr) -> Option<Folded> {
    match expr {
        Expr::Number(n) => Some(Folded::Number(*n)),
        Expr::Str(s) => Some(Folded::Str(s.clone())),
        Expr::Bool(b) => Some(Folded::Bool(*b)),
        Expr::Null => Some(Folded::Null),
        Expr::Undefined => Some(Folded::Undefined),
        Expr::Unary { op, operand } => fold_unary(*op, &fold_expr(operand)?),
        Expr::Binary { op, lhs, rhs } => fold_binary(*op, &fold_expr(lhs)?, &fold_expr(rhs)?),
        Expr::Logical { op, lhs, rhs } => {
            let lhs = fold_expr(lhs)?;
            let takes_lhs = match op {
                LogicalOp::And => !lhs.is_truthy(),
                LogicalOp::Or => lhs.is_truthy(),
                LogicalOp::NullishCoalescing => !lhs.is_nullish(),
            };
            if takes_lhs { Some(lhs) } else { fold_expr(rhs) }
        }
        Expr::Conditional { test, consequent, alternate } => {
            if fold_expr(test)?.is_truthy() {
                fold_expr(consequent)
            } else {
                fold_expr(alternate)
            }
        }
        _ => None,
    }
}

fn fold_unary(op: UnaryOp, operand: &Folded) -> Option<Folded> {
    match (op, operand) {
        (UnaryOp::Minus, Folded::Number(n)) => Some(Folded::Number(-n)),
        (UnaryOp::Plus, Folded::Number(n)) => Some(Folded::Number(*n)),
        (UnaryOp::Not, operand) => Some(Folded::Bool(!operand.is_truthy())),
        (UnaryOp::BitwiseNot, Folded::Number(n)) => Some(Folded::Number(!to_int32(*n) as f64)),
        (UnaryOp::Void, _) => Some(Folded::Undefined),
        // typeof and delete are left to the general lowering.
        _ => None,
    }
}

fn fold_binary(op: BinaryOp, lhs: &Folded, rhs: &Folded) -> Option<Folded> {
    use BinaryOp::*;
    use Folded::*;
    match (op, lhs, rhs) {
        (Add, Number(a), Number(b)) => Some(Number(a + b)),
        (Add, Str(a), Str(b)) => Some(Str(format!("{a}{b}"))),
        (Sub, Number(a), Number(b)) => Some(Number(a - b)),
        (Mul, Number(a), Number(b)) => Some(Number(a * b)),
        (Div, Number(a), Number(b)) => Some(Number(a / b)),
        (Mod, Number(a), Number(b)) => Some(Number(a % b)),

        // The bitwise family is specified over exact 32-bit two's-complement
        // truncation; `x | 0` must wrap, never saturate.
        (BitwiseAnd, Number(a), Number(b)) => Some(Number((to_int32(*a) & to_int32(*b)) as f64)),
        (BitwiseOr, Number(a), Number(b)) => Some(Number((to_int32(*a) | to_int32(*b)) as f64)),
        (BitwiseXor, Number(a), Number(b)) => Some(Number((to_int32(*a) ^ to_int32(*b)) as f64)),
        (LeftShift, Number(a), Number(b)) => {
            Some(Number((to_int32(*a) << (to_uint32(*b) & 31)) as f64))
        }
        (RightShift, Number(a), Number(b)) => {
            Some(Number((to_int32(*a) >> (to_uint32(*b) & 31)) as f64))
        }
        (UnsignedRightShift, Number(a), Number(b)) => {
            Some(Number((to_uint32(*a) >> (to_uint32(*b) & 31)) as f64))
        }

        (LessThan, Number(a), Number(b)) => Some(Bool(a < b)),
        (LessThanEquals, Number(a), Number(b)) => Some(Bool(a <= b)),
        (GreaterThan, Number(a), Number(b)) => Some(Bool(a > b)),
        (GreaterThanEquals, Number(a), Number(b)) => Some(Bool(a >= b)),

        (StrictlyEquals, a, b) => Some(Bool(folded_strictly_equal(a, b))),
        (StrictlyInequals, a, b) => Some(Bool(!folded_strictly_equal(a, b))),
        (LooselyEquals, a, b) => folded_loosely_equal(a, b).map(Bool),
        (LooselyInequals, a, b) => folded_loosely_equal(a, b).map(|eq| Bool(!eq)),

        // `in` and `instanceof` can throw and are never folded.
        _ => None,
    }
}

fn folded_strictly_equal(a: &Folded, b: &Folded) -> bool {
    match (a, b) {
        (Folded::Number(x), Folded::Number(y)) => x == y,
        (Folded::Str(x), Folded::Str(y)) => x == y,
        (Folded::Bool(x), Folded::Bool(y)) => x == y,
        (Folded::Null, Folded::Null) | (Folded::Undefined, Folded::Undefined) => true,
        _ => false,
    }
}

fn folded_loosely_equal(a: &Folded, b: &Folded) -> Option<bool> {
    match (a, b) {
        (Folded::Null | Folded::Undefined, Folded::Null | Folded::Undefined) => Some(true),
        (Folded::Number(_), Folded::Number(_))
        | (Folded::Str(_), Folded::Str(_))
        | (Folded::Bool(_), Folded::Bool(_)) => Some(folded_strictly_equal(a, b)),
        // Cross-type coercion cases are left to the runtime.
        _ => None,
    }
}

fn assign_op_binary(op: AssignOp) -> BinaryOp {
    match op {
        AssignOp::Add => BinaryOp::Add,
        AssignOp::Sub => BinaryOp::Sub,
        AssignOp::Mul => BinaryOp::Mul,
        AssignOp::Div => BinaryOp::Div,
        AssignOp::Mod => BinaryOp::Mod,
        AssignOp::BitwiseAnd => BinaryOp::BitwiseAnd,
        AssignOp::BitwiseOr => BinaryOp::BitwiseOr,
        AssignOp::BitwiseXor => BinaryOp::BitwiseXor,
        AssignOp::LeftShift => BinaryOp::LeftShift,
        AssignOp::RightShift => BinaryOp::RightShift,
        AssignOp::UnsignedRightShift => BinaryOp::UnsignedRightShift,
        AssignOp::Assign => unreachable!("plain assignment has no binary operator"),
    }
}

fn binary_instruction(op: BinaryOp, dst: Operand, lhs: Operand, rhs: Operand) -> Instruction {
    match op {
        BinaryOp::Add => Instruction::Add { dst, lhs, rhs },
        BinaryOp::Sub => Instruction::Sub { dst, lhs, rhs },
        BinaryOp::Mul => Instruction::Mul { dst, lhs, rhs },
        BinaryOp::Div => Instruction::Div { dst, lhs, rhs },
        BinaryOp::Mod => Instruction::Mod { dst, lhs, rhs },
        BinaryOp::BitwiseAnd => Instruction::BitwiseAnd { dst, lhs, rhs },
        BinaryOp::BitwiseOr => Instruction::BitwiseOr { dst, lhs, rhs },
        BinaryOp::BitwiseXor => Instruction::BitwiseXor { dst, lhs, rhs },
        BinaryOp::LeftShift => Instruction::LeftShift { dst, lhs, rhs },
        BinaryOp::RightShift => Instruction::RightShift { dst, lhs, rhs },
        BinaryOp::UnsignedRightShift => Instruction::UnsignedRightShift { dst, lhs, rhs },
        BinaryOp::LessThan => Instruction::LessThan { dst, lhs, rhs },
        BinaryOp::LessThanEquals => Instruction::LessThanEquals { dst, lhs, rhs },
        BinaryOp::GreaterThan => Instruction::GreaterThan { dst, lhs, rhs },
        BinaryOp::GreaterThanEquals => Instruction::GreaterThanEquals { dst, lhs, rhs },
        BinaryOp::LooselyEquals => Instruction::LooselyEquals { dst, lhs, rhs },
        BinaryOp::LooselyInequals => Instruction::LooselyInequals { dst, lhs, rhs },
        BinaryOp::StrictlyEquals => Instruction::StrictlyEquals { dst, lhs, rhs },
        BinaryOp::StrictlyInequals => Instruction::StrictlyInequals { dst, lhs, rhs },
        BinaryOp::In => Instruction::In { dst, lhs, rhs },
        BinaryOp::InstanceOf => Instruction::InstanceOf { dst, lhs, rhs },
    }
}

/// Lexical bindings without frame slots declared directly in a statement
/// list; they need an environment record for the enclosing scope.
fn collect_scoped_bindings(stmts: &[Stmt], generator: &Generator) -> Vec<(String, bool)> {
    let mut bindings = Vec::new();
    for stmt in stmts {
        match stmt {
            Stmt::Decl(decl) if decl.kind.is_lexical() => {
                for declarator in &decl.declarators {
                    collect_unslotted(&declarator.target, decl.kind == DeclKind::Const, &mut bindings);
                }
            }
            Stmt::FunctionDecl(node) => {
                if let Some(name) = &node.name {
                    if generator.lookup_local(name).is_none() {
                        bindings.push((name.clone(), false));
                    }
                }
            }
            Stmt::ClassDecl(node) => {
                if let Some(name) = &node.name {
                    if generator.lookup_local(name).is_none() {
                        bindings.push((name.clone(), false));
                    }
                }
            }
            _ => {}
        }
    }
    bindings
}

fn collect_unslotted(target: &BindingTarget, immutable: bool, out: &mut Vec<(String, bool)>) {
    match target {
        BindingTarget::Ident(ident) => {
            if ident.slot.is_none() {
                out.push((ident.name.clone(), immutable));
            }
        }
        BindingTarget::Pattern(pattern) => match &**pattern {
            Pattern::Array(elements) => {
                for element in elements {
                    if let Some(target) = &element.target {
                        collect_unslotted(target, immutable, out);
                    }
                }
            }
            Pattern::Object(properties) => {
                for property in properties {
                    collect_unslotted(&property.target, immutable, out);
                }
            }
        },
    }
}

impl Generator {
    fn folded_operand(&mut self, folded: &Folded) -> Operand {
        match folded {
            Folded::Number(n) => self.add_number_constant(*n),
            Folded::Str(s) => self.add_string_constant(s),
            Folded::Bool(b) => self.add_bool_constant(*b),
            Folded::Null => self.add_null_constant(),
            Folded::Undefined => self.add_undefined_constant(),
        }
    }

    fn into_preferred(&mut self, value: Operand, preferred: Option<Operand>) -> Operand {
        match preferred {
            Some(dst) => {
                self.emit_mov(dst, value);
                dst
            }
            None => value,
        }
    }

    /// Copy an operand whose slot later evaluation could overwrite (locals,
    /// arguments, reserved registers) into a fresh register.
    fn copy_if_needed(&mut self, operand: Operand) -> Operand {
        let mutable = match operand {
            Operand::Local(_) | Operand::Argument(_) => true,
            Operand::Register(index) => index < Register::RESERVED_COUNT,
            Operand::Constant(_) => false,
        };
        if mutable {
            let register = self.allocate_register();
            self.emit_mov(register, operand);
            register
        } else {
            operand
        }
    }

    fn completion_constant(&mut self, completion: i32) -> Operand {
        self.add_number_constant(completion as f64)
    }

    // ---- statements ------------------------------------------------------

    pub(crate) fn compile_stmt(&mut self, stmt: &Stmt) -> Option<Operand> {
        match stmt {
            Stmt::Expr(expr) => Some(self.compile_expr(expr, None)),
            Stmt::Decl(decl) => {
                self.compile_var_decl(decl);
                None
            }
            Stmt::Block(stmts) => {
                self.compile_block_body(stmts);
                None
            }
            Stmt::If(stmt) => {
                self.compile_if(stmt);
                None
            }
            Stmt::While(stmt) => {
                self.compile_while(stmt, Vec::new());
                None
            }
            Stmt::DoWhile(stmt) => {
                self.compile_do_while(stmt, Vec::new());
                None
            }
            Stmt::For(stmt) => {
                self.compile_for(stmt, Vec::new());
                None
            }
            Stmt::ForIn(stmt) => {
                self.compile_for_in(stmt, Vec::new());
                None
            }
            Stmt::ForOf(stmt) => {
                self.compile_for_of(stmt, Vec::new());
                None
            }
            Stmt::Switch(stmt) => {
                self.compile_switch(stmt, Vec::new());
                None
            }
            Stmt::Labelled(stmt) => {
                self.compile_labelled(stmt);
                None
            }
            Stmt::Break(label) => {
                match label {
                    Some(label) => self.generate_labelled_break(label),
                    None => self.generate_break(),
                }
                None
            }
            Stmt::Continue(label) => {
                match label {
                    Some(label) => self.generate_labelled_continue(label),
                    None => self.generate_continue(),
                }
                None
            }
            Stmt::Return(argument) => {
                self.compile_return(argument.as_ref());
                None
            }
            Stmt::Throw(expr) => {
                let value = self.compile_expr(expr, None);
                self.emit(Instruction::Throw { src: value });
                None
            }
            Stmt::Try(stmt) => {
                self.compile_try(stmt);
                None
            }
            Stmt::FunctionDecl(node) => {
                self.compile_function_declaration(node);
                None
            }
            Stmt::ClassDecl(node) => {
                let value = self.compile_class(node, None);
                let name = node.name.clone().expect("class declaration requires a name");
                self.bind_name(&name, value);
                None
            }
            Stmt::Empty => None,
            Stmt::Error(span) => panic!("no lowering rule for parse-error statement at {span:?}"),
        }
    }

    fn compile_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.compile_stmt(stmt);
        }
    }

    /// A braced statement list: lexical declarations without frame slots get
    /// a fresh environment for the block's duration.
    fn compile_block_body(&mut self, stmts: &[Stmt]) {
        let bindings = collect_scoped_bindings(stmts, self);
        let scoped = !bindings.is_empty();
        if scoped {
            self.begin_variable_scope();
            for (name, immutable) in &bindings {
                let identifier = self.intern_identifier(name);
                self.emit(Instruction::CreateVariable { identifier, immutable: *immutable });
            }
        }
        self.compile_stmts(stmts);
        if scoped {
            self.end_variable_scope();
        }
    }

    fn compile_var_decl(&mut self, decl: &VarDecl) {
        let mode = if decl.kind.is_lexical() { BindingMode::Initialize } else { BindingMode::Set };
        for declarator in &decl.declarators {
            match &declarator.target {
                BindingTarget::Ident(ident) => {
                    // A let/const binding cannot be redeclared, so its
                    // initializer may evaluate straight into the slot. var
                    // initializers can observe the previous value and must
                    // not.
                    let init_dst = match ident.slot {
                        Some(Slot::Local(index)) if decl.kind.is_lexical() => Some(self.local(index)),
                        _ => None,
                    };
                    match &declarator.init {
                        Some(init) => {
                            let value = self.compile_expr(init, init_dst);
                            self.emit_ident_assignment(ident, value, mode);
                        }
                        None if decl.kind.is_lexical() => {
                            let undefined = self.add_undefined_constant();
                            self.emit_ident_assignment(ident, undefined, mode);
                        }
                        None => {}
                    }
                }
                BindingTarget::Pattern(pattern) => {
                    let init = declarator
                        .init
                        .as_ref()
                        .expect("destructuring declarator requires an initializer");
                    let value = self.compile_expr(init, None);
                    let value = self.copy_if_needed(value);
                    self.compile_pattern(pattern, value, mode);
                }
            }
        }
    }

    fn compile_if(&mut self, stmt: &IfStmt) {
        // A statically-known test emits only the reachable branch.
        if let Some(folded) = fold_expr(&stmt.test) {
            if folded.is_truthy() {
                self.compile_block_body(&stmt.consequent);
            } else if let Some(alternate) = &stmt.alternate {
                self.compile_block_body(alternate);
            }
            return;
        }

        let test = self.compile_expr(&stmt.test, None);
        let true_block = self.make_block();
        let false_block = self.make_block();
        self.emit_jump_if(test, true_block, false_block);

        if let Some(alternate) = &stmt.alternate {
            let end_block = self.make_block();
            self.switch_to_block(true_block);
            self.compile_block_body(&stmt.consequent);
            if !self.is_current_block_terminated() {
                self.emit(Instruction::Jump { target: end_block });
            }
            self.switch_to_block(false_block);
            self.compile_block_body(alternate);
            if !self.is_current_block_terminated() {
                self.emit(Instruction::Jump { target: end_block });
            }
            self.switch_to_block(end_block);
        } else {
            self.switch_to_block(true_block);
            self.compile_block_body(&stmt.consequent);
            if !self.is_current_block_terminated() {
                self.emit(Instruction::Jump { target: false_block });
            }
            self.switch_to_block(false_block);
        }
    }

    fn compile_while(&mut self, stmt: &WhileStmt, labels: Vec<String>) {
        let folded_test = fold_expr(&stmt.test);
        if let Some(folded) = &folded_test {
            if !folded.is_truthy() {
                // The body is unreachable and literal tests have no effects.
                return;
            }
        }

        let test_block = self.make_block();
        let body_block = self.make_block();
        let end_block = self.make_block();
        self.emit(Instruction::Jump { target: test_block });
        self.switch_to_block(test_block);
        if folded_test.is_some() {
            self.emit(Instruction::Jump { target: body_block });
        } else {
            let test = self.compile_expr(&stmt.test, None);
            self.emit_jump_if(test, body_block, end_block);
        }

        self.switch_to_block(body_block);
        self.begin_breakable_scope(end_block, labels.clone());
        self.begin_continuable_scope(test_block, labels);
        self.compile_block_body(&stmt.body);
        self.end_continuable_scope();
        self.end_breakable_scope();
        if !self.is_current_block_terminated() {
            self.emit(Instruction::Jump { target: test_block });
        }
        self.switch_to_block(end_block);
    }

    fn compile_do_while(&mut self, stmt: &WhileStmt, labels: Vec<String>) {
        let body_block = self.make_block();
        let test_block = self.make_block();
        let end_block = self.make_block();
        self.emit(Instruction::Jump { target: body_block });

        self.switch_to_block(body_block);
        self.begin_breakable_scope(end_block, labels.clone());
        self.begin_continuable_scope(test_block, labels);
        self.compile_block_body(&stmt.body);
        self.end_continuable_scope();
        self.end_breakable_scope();
        if !self.is_current_block_terminated() {
            self.emit(Instruction::Jump { target: test_block });
        }

        self.switch_to_block(test_block);
        match fold_expr(&stmt.test) {
            Some(folded) if folded.is_truthy() => self.emit(Instruction::Jump { target: body_block }),
            Some(_) => self.emit(Instruction::Jump { target: end_block }),
            None => {
                let test = self.compile_expr(&stmt.test, None);
                self.emit_jump_if(test, body_block, end_block);
            }
        }
        self.switch_to_block(end_block);
    }

    fn compile_for(&mut self, stmt: &ForStmt, labels: Vec<String>) {
        match &stmt.init {
            Some(ForInit::Decl(decl)) => self.compile_var_decl(decl),
            Some(ForInit::Expr(expr)) => {
                self.compile_expr(expr, None);
            }
            None => {}
        }

        let test_block = self.make_block();
        let body_block = self.make_block();
        let update_block = self.make_block();
        let end_block = self.make_block();
        self.emit(Instruction::Jump { target: test_block });

        self.switch_to_block(test_block);
        match &stmt.test {
            None => self.emit(Instruction::Jump { target: body_block }),
            Some(test) => match fold_expr(test) {
                Some(folded) if folded.is_truthy() => self.emit(Instruction::Jump { target: body_block }),
                Some(_) => self.emit(Instruction::Jump { target: end_block }),
                None => {
                    let test = self.compile_expr(test, None);
                    self.emit_jump_if(test, body_block, end_block);
                }
            },
        }

        self.switch_to_block(body_block);
        self.begin_breakable_scope(end_block, labels.clone());
        self.begin_continuable_scope(update_block, labels);
        self.compile_block_body(&stmt.body);
        self.end_continuable_scope();
        self.end_breakable_scope();
        if !self.is_current_block_terminated() {
            self.emit(Instruction::Jump { target: update_block });
        }

        self.switch_to_block(update_block);
        if let Some(update) = &stmt.update {
            self.compile_expr(update, None);
        }
        self.emit(Instruction::Jump { target: test_block });
        self.switch_to_block(end_block);
    }

    fn compile_for_target_assignment(&mut self, target: &ForTarget, value: Operand) {
        match target {
            ForTarget::Decl { kind, target } => {
                let mode = if kind.is_lexical() { BindingMode::Initialize } else { BindingMode::Set };
                self.emit_binding_assignment(target, value, mode);
            }
            ForTarget::Assign(expr) => self.emit_store_to_reference(expr, value),
        }
    }

    fn compile_for_in(&mut self, stmt: &ForInStmt, labels: Vec<String>) {
        let object = self.compile_expr(&stmt.object, None);

        let end_block = self.make_block();
        let continuation = self.make_block();
        // Enumerating a nullish value visits nothing.
        self.emit(Instruction::JumpNullish {
            src: object,
            true_target: end_block,
            false_target: continuation,
        });
        self.switch_to_block(continuation);

        let iterator = self.allocate_register();
        self.emit(Instruction::GetObjectPropertyIterator { dst: iterator, src: object });

        let loop_update = self.make_block();
        self.emit(Instruction::Jump { target: loop_update });
        self.switch_to_block(loop_update);

        let value = self.allocate_register();
        let done = self.allocate_register();
        self.emit(Instruction::IteratorNextUnpack { value_dst: value, done_dst: done, iterator });
        let body_block = self.make_block();
        self.emit_jump_if(done, end_block, body_block);

        self.switch_to_block(body_block);
        self.begin_breakable_scope(end_block, labels.clone());
        self.begin_continuable_scope(loop_update, labels);
        self.compile_for_target_assignment(&stmt.target, value);
        self.compile_block_body(&stmt.body);
        self.end_continuable_scope();
        self.end_breakable_scope();
        if !self.is_current_block_terminated() {
            self.emit(Instruction::Jump { target: loop_update });
        }
        self.switch_to_block(end_block);
    }

    // for-of and for-await-of install a synthetic finally-style context so
    // that abrupt exit (break, return, throw, continue to an outer loop)
    // closes the iterator. continue to this loop hits its Continue boundary
    // before the context and deliberately skips the close: the loop keeps
    // driving the iterator. Exceptions thrown while stepping the iterator
    // itself propagate without a close.
    fn compile_for_of(&mut self, stmt: &ForOfStmt, labels: Vec<String>) {
        let iterable = self.compile_expr(&stmt.iterable, None);
        let iterator = self.allocate_register();
        let hint = if stmt.is_await { IteratorHint::Async } else { IteratorHint::Sync };
        self.emit(Instruction::GetIterator { dst: iterator, src: iterable, hint });

        let end_block = self.make_block();
        self.begin_breakable_scope(end_block, labels.clone());

        let environment_at_entry = self.ensure_lexical_environment_register();
        let close_type = self.allocate_register();
        let close_value = self.allocate_register();
        let exception_preamble = self.make_block();
        let close_body = self.make_block();
        let parent = self.current_finally_context();
        let context = self.push_finally_context(FinallyContext {
            completion_type: close_type,
            completion_value: close_value,
            finally_body: close_body,
            exception_preamble,
            parent,
            registered_jumps: Vec::new(),
            next_jump_index: FIRST_JUMP_INDEX,
            environment_at_entry,
        });
        self.start_boundary(BlockBoundary::ReturnToFinally);

        let loop_update = self.make_block();
        self.emit(Instruction::Jump { target: loop_update });
        self.switch_to_block(loop_update);
        self.begin_continuable_scope(loop_update, labels);

        let next_value = self.allocate_register();
        let done = self.allocate_register();
        self.emit(Instruction::IteratorNextUnpack { value_dst: next_value, done_dst: done, iterator });
        let loop_continue = self.make_block();
        self.emit_jump_if(done, end_block, loop_continue);
        self.switch_to_block(loop_continue);

        let next_value = if stmt.is_await { self.generate_await_value(next_value) } else { next_value };

        // Only LHS assignment and body exceptions close the iterator; the
        // handler is installed after the iterator-next section.
        self.push_unwind_context(None, Some(exception_preamble));
        let loop_body = self.make_block();
        self.emit(Instruction::Jump { target: loop_body });
        self.switch_to_block(loop_body);

        self.compile_for_target_assignment(&stmt.target, next_value);
        self.compile_block_body(&stmt.body);

        self.end_continuable_scope();
        self.end_boundary(BlockBoundary::ReturnToFinally);
        self.set_current_finally_context(parent);
        self.pop_unwind_context();
        self.end_breakable_scope();

        if !self.is_current_block_terminated() {
            self.emit(Instruction::Jump { target: loop_update });
        }

        // Exception preamble: capture, restore environment, mark Throw.
        self.switch_to_block(exception_preamble);
        self.emit(Instruction::Catch { dst: close_value });
        self.emit(Instruction::SetLexicalEnvironment { src: environment_at_entry });
        let throw_constant = self.completion_constant(COMPLETION_THROW);
        self.emit_mov(close_type, throw_constant);
        self.emit(Instruction::Jump { target: close_body });

        // Close body: the original throw always wins over close errors.
        self.switch_to_block(close_body);
        let throw_close = self.make_block();
        let non_throw_close = self.make_block();
        self.emit(Instruction::JumpStrictlyEquals {
            lhs: close_type,
            rhs: throw_constant,
            true_target: throw_close,
            false_target: non_throw_close,
        });

        self.switch_to_block(non_throw_close);
        let undefined = self.add_undefined_constant();
        self.emit(Instruction::IteratorClose {
            iterator,
            completion: CloseCompletion::Normal,
            value: undefined,
        });
        let jumps = self.finally_context(context).registered_jumps.clone();
        for (index, target) in jumps {
            let after = self.make_block();
            let jump_constant = self.add_number_constant(index as f64);
            self.emit(Instruction::JumpStrictlyEquals {
                lhs: close_type,
                rhs: jump_constant,
                true_target: target,
                false_target: after,
            });
            self.switch_to_block(after);
        }
        let return_block = self.make_block();
        let unreachable_block = self.make_block();
        let return_constant = self.completion_constant(COMPLETION_RETURN);
        self.emit(Instruction::JumpStrictlyEquals {
            lhs: close_type,
            rhs: return_constant,
            true_target: return_block,
            false_target: unreachable_block,
        });
        self.switch_to_block(return_block);
        if let Some(parent_index) = parent {
            let outer_type = self.finally_context(parent_index).completion_type;
            let outer_value = self.finally_context(parent_index).completion_value;
            let outer_body = self.finally_context(parent_index).finally_body;
            self.emit_mov(outer_type, close_type);
            self.emit_mov(outer_value, close_value);
            self.emit(Instruction::Jump { target: outer_body });
        } else if self.is_in_generator_or_async_function() {
            self.emit(Instruction::Yield { continuation: None, value: close_value });
        } else {
            self.emit(Instruction::Return { src: close_value });
        }
        // Every completion type has been dispatched.
        self.switch_to_block(unreachable_block);
        self.emit(Instruction::Throw { src: close_value });

        self.switch_to_block(throw_close);
        self.emit(Instruction::IteratorClose {
            iterator,
            completion: CloseCompletion::Throw,
            value: close_value,
        });
        if !self.is_current_block_terminated() {
            self.emit(Instruction::Throw { src: close_value });
        }

        self.switch_to_block(end_block);
    }

    fn compile_switch(&mut self, stmt: &SwitchStmt, labels: Vec<String>) {
        let discriminant = self.compile_expr(&stmt.discriminant, None);
        let discriminant = self.copy_if_needed(discriminant);

        let end_block = self.make_block();
        self.begin_breakable_scope(end_block, labels);

        let case_blocks: Vec<Label> = stmt.cases.iter().map(|_| self.make_block()).collect();
        let mut default_index = None;
        for (index, case) in stmt.cases.iter().enumerate() {
            match &case.test {
                Some(test) => {
                    let test_value = self.compile_expr(test, None);
                    let next_test = self.make_block();
                    self.emit(Instruction::JumpStrictlyEquals {
                        lhs: discriminant,
                        rhs: test_value,
                        true_target: case_blocks[index],
                        false_target: next_test,
                    });
                    self.switch_to_block(next_test);
                }
                None => default_index = Some(index),
            }
        }
        let fallback = default_index.map(|i| case_blocks[i]).unwrap_or(end_block);
        self.emit(Instruction::Jump { target: fallback });

        for (index, case) in stmt.cases.iter().enumerate() {
            self.switch_to_block(case_blocks[index]);
            self.compile_stmts(&case.body);
            if !self.is_current_block_terminated() {
                let next = case_blocks.get(index + 1).copied().unwrap_or(end_block);
                self.emit(Instruction::Jump { target: next });
            }
        }

        self.end_breakable_scope();
        self.switch_to_block(end_block);
    }

    fn compile_labelled(&mut self, stmt: &LabelledStmt) {
        let mut labels = vec![stmt.label.clone()];
        let mut body = &stmt.body;
        while let Stmt::Labelled(inner) = body {
            labels.push(inner.label.clone());
            body = &inner.body;
        }
        match body {
            Stmt::While(inner) => self.compile_while(inner, labels),
            Stmt::DoWhile(inner) => self.compile_do_while(inner, labels),
            Stmt::For(inner) => self.compile_for(inner, labels),
            Stmt::ForIn(inner) => self.compile_for_in(inner, labels),
            Stmt::ForOf(inner) => self.compile_for_of(inner, labels),
            Stmt::Switch(inner) => self.compile_switch(inner, labels),
            other => {
                let end_block = self.make_block();
                self.begin_breakable_scope(end_block, labels);
                self.compile_stmt(other);
                self.end_breakable_scope();
                if !self.is_current_block_terminated() {
                    self.emit(Instruction::Jump { target: end_block });
                }
                self.switch_to_block(end_block);
            }
        }
    }

    fn compile_return(&mut self, argument: Option<&Expr>) {
        match argument {
            Some(expr) => {
                let value = self.compile_expr(expr, None);
                // An async function awaits its returned expression so a
                // rejecting value routes through throw before the return.
                let value = if self.is_in_async_function() {
                    self.generate_await_value(value)
                } else {
                    value
                };
                self.emit_return(value);
            }
            None => {
                let undefined = self.add_undefined_constant();
                self.emit_return(undefined);
            }
        }
    }

    // try/catch/finally lowers to the completion-record protocol: two
    // registers carry (type, value), every path into the finally body sets
    // them first, and a dispatch chain after the body routes NORMAL, each
    // registered break/continue index, RETURN, and finally rethrow, in that
    // order. Nested finallys chain by copying the record to the parent
    // context.
    fn compile_try(&mut self, stmt: &TryStmt) {
        let saved_block = self.current_block_label();
        let environment_at_entry = self.ensure_lexical_environment_register();

        let mut finally: Option<(usize, Operand, Operand, Label, Label)> = None;
        if stmt.finalizer.is_some() {
            let completion_type = self.allocate_register();
            let completion_value = self.allocate_register();
            let exception_preamble = self.make_block();
            let finally_body = self.make_block();
            let parent = self.current_finally_context();
            let context = self.push_finally_context(FinallyContext {
                completion_type,
                completion_value,
                finally_body,
                exception_preamble,
                parent,
                registered_jumps: Vec::new(),
                next_jump_index: FIRST_JUMP_INDEX,
                environment_at_entry,
            });

            self.switch_to_block(exception_preamble);
            self.emit(Instruction::Catch { dst: completion_value });
            self.emit(Instruction::SetLexicalEnvironment { src: environment_at_entry });
            let throw_constant = self.completion_constant(COMPLETION_THROW);
            self.emit_mov(completion_type, throw_constant);
            self.emit(Instruction::Jump { target: finally_body });

            self.start_boundary(BlockBoundary::ReturnToFinally);
            finally = Some((context, completion_type, completion_value, exception_preamble, finally_body));
        }

        let mut next_block: Option<Label> = None;
        let mut handler_label: Option<Label> = None;
        if let Some(handler) = &stmt.handler {
            if let Some((_, _, _, preamble, _)) = finally {
                self.push_unwind_context(None, Some(preamble));
            }
            let handler_block = self.make_block();
            self.switch_to_block(handler_block);
            let caught = self.allocate_register();
            self.emit(Instruction::Catch { dst: caught });
            self.emit(Instruction::SetLexicalEnvironment { src: environment_at_entry });

            let mut created_scope = false;
            match &handler.parameter {
                Some(BindingTarget::Ident(ident)) => match ident.slot {
                    Some(Slot::Local(index)) => {
                        let local = self.local(index);
                        self.emit_mov(local, caught);
                        self.set_local_initialized(index);
                    }
                    Some(Slot::Argument(index)) => {
                        let argument = self.argument(index);
                        self.emit_mov(argument, caught);
                    }
                    None => {
                        self.begin_variable_scope();
                        created_scope = true;
                        let identifier = self.intern_identifier(&ident.name);
                        self.emit(Instruction::CreateVariable { identifier, immutable: false });
                        let cache = self.next_environment_cache();
                        self.emit(Instruction::SetVariable {
                            identifier,
                            src: caught,
                            mode: BindingMode::Initialize,
                            cache,
                        });
                    }
                },
                Some(BindingTarget::Pattern(pattern)) => {
                    self.compile_pattern(pattern, caught, BindingMode::Initialize);
                }
                None => {}
            }
            self.compile_stmts(&handler.body);
            if created_scope {
                self.end_variable_scope();
            }
            if !self.is_current_block_terminated() {
                if let Some((_, completion_type, _, _, finally_body)) = finally {
                    let normal = self.completion_constant(COMPLETION_NORMAL);
                    self.emit_mov(completion_type, normal);
                    self.emit(Instruction::Jump { target: finally_body });
                } else {
                    let target = match next_block {
                        Some(label) => label,
                        None => {
                            let label = self.make_block();
                            next_block = Some(label);
                            label
                        }
                    };
                    self.emit(Instruction::Jump { target });
                }
            }
            if finally.is_some() {
                self.pop_unwind_context();
            }
            handler_label = Some(handler_block);
        }

        if finally.is_some() {
            self.end_boundary(BlockBoundary::ReturnToFinally);
        }

        let preamble = finally.map(|f| f.3);
        self.push_unwind_context(handler_label, preamble);
        let try_block = self.make_block();
        self.switch_to_block(saved_block);
        self.emit(Instruction::Jump { target: try_block });
        if finally.is_some() {
            self.start_boundary(BlockBoundary::ReturnToFinally);
        }
        self.switch_to_block(try_block);
        self.compile_block_body(&stmt.block);
        if !self.is_current_block_terminated() {
            if let Some((_, completion_type, _, _, finally_body)) = finally {
                let normal = self.completion_constant(COMPLETION_NORMAL);
                self.emit_mov(completion_type, normal);
                self.emit(Instruction::Jump { target: finally_body });
            } else {
                let target = match next_block {
                    Some(label) => label,
                    None => {
                        let label = self.make_block();
                        next_block = Some(label);
                        label
                    }
                };
                self.emit(Instruction::Jump { target });
            }
        }
        if finally.is_some() {
            self.end_boundary(BlockBoundary::ReturnToFinally);
        }
        self.pop_unwind_context();

        // The finally body and its dispatch chain are generated after the try
        // body so that jumps registered by break/continue in it are known.
        if let Some((context, completion_type, completion_value, _, finally_body)) = finally {
            let parent = self.finally_context(context).parent;
            self.set_current_finally_context(parent);

            self.switch_to_block(finally_body);
            self.start_boundary(BlockBoundary::LeaveFinally);
            self.compile_block_body(stmt.finalizer.as_ref().unwrap());
            self.end_boundary(BlockBoundary::LeaveFinally);

            if !self.is_current_block_terminated() {
                let target = match next_block {
                    Some(label) => label,
                    None => {
                        let label = self.make_block();
                        next_block = Some(label);
                        label
                    }
                };

                let after_normal = self.make_block();
                let normal = self.completion_constant(COMPLETION_NORMAL);
                self.emit(Instruction::JumpStrictlyEquals {
                    lhs: completion_type,
                    rhs: normal,
                    true_target: target,
                    false_target: after_normal,
                });
                self.switch_to_block(after_normal);

                let jumps = self.finally_context(context).registered_jumps.clone();
                for (index, jump_target) in jumps {
                    let after = self.make_block();
                    let jump_constant = self.add_number_constant(index as f64);
                    self.emit(Instruction::JumpStrictlyEquals {
                        lhs: completion_type,
                        rhs: jump_constant,
                        true_target: jump_target,
                        false_target: after,
                    });
                    self.switch_to_block(after);
                }

                let return_block = self.make_block();
                let rethrow_block = self.make_block();
                let return_constant = self.completion_constant(COMPLETION_RETURN);
                self.emit(Instruction::JumpStrictlyEquals {
                    lhs: completion_type,
                    rhs: return_constant,
                    true_target: return_block,
                    false_target: rethrow_block,
                });

                self.switch_to_block(return_block);
                if let Some(parent_index) = parent {
                    let outer_type = self.finally_context(parent_index).completion_type;
                    let outer_value = self.finally_context(parent_index).completion_value;
                    let outer_body = self.finally_context(parent_index).finally_body;
                    self.emit_mov(outer_type, completion_type);
                    self.emit_mov(outer_value, completion_value);
                    self.emit(Instruction::Jump { target: outer_body });
                } else if self.is_in_generator_or_async_function() {
                    self.emit(Instruction::Yield { continuation: None, value: completion_value });
                } else {
                    self.emit(Instruction::Return { src: completion_value });
                }

                // The trailing else of the chain: the completion must be the
                // original exception.
                self.switch_to_block(rethrow_block);
                self.emit(Instruction::Throw { src: completion_value });
            }
        }

        let target = match next_block {
            Some(label) => label,
            None => self.make_block(),
        };
        self.switch_to_block(target);
    }

    fn compile_function_declaration(&mut self, node: &FunctionNode) {
        let template = compile_function(node);
        let template_index = self.register_template(template);
        let dst = self.allocate_register();
        self.emit(Instruction::NewFunction { dst, template: template_index });
        if let Some(name) = &node.name {
            self.bind_name(name, dst);
        }
    }

    fn bind_name(&mut self, name: &str, value: Operand) {
        if let Some(index) = self.lookup_local(name) {
            let local = self.local(index);
            self.emit_mov(local, value);
            self.set_local_initialized(index);
        } else {
            let identifier = self.intern_identifier(name);
            let cache = self.next_environment_cache();
            self.emit(Instruction::SetVariable {
                identifier,
                src: value,
                mode: BindingMode::Initialize,
                cache,
            });
        }
    }

    // Class bodies compile to a static blueprint instantiated per
    // evaluation: methods, getters, setters and static initializers become
    // registered templates, literal-valued fields become inline constants,
    // and everything else gets a zero-argument initializer thunk.
    fn compile_class(&mut self, node: &ClassNode, preferred: Option<Operand>) -> Operand {
        let mut constructor = None;
        let mut members = Vec::new();
        for member in &node.members {
            if member.kind == ClassMemberKind::Method && !member.is_static && member.key == "constructor" {
                let function = member.function.as_ref().expect("constructor requires a body");
                let template = compile_function(function);
                constructor = Some(self.register_template(template));
                continue;
            }
            let descriptor = match member.kind {
                ClassMemberKind::Field => {
                    let value = match &member.field_init {
                        Some(init) => match fold_expr(init) {
                            Some(folded) => {
                                let constant = self.folded_operand(&folded);
                                MemberValue::Constant(constant.index())
                            }
                            None => {
                                let thunk = field_initializer_function(init);
                                let template = compile_function(&thunk);
                                MemberValue::Template(self.register_template(template))
                            }
                        },
                        None => {
                            let constant = self.add_undefined_constant();
                            MemberValue::Constant(constant.index())
                        }
                    };
                    ClassMemberDescriptor {
                        kind: MemberKind::Field,
                        key: self.intern_identifier(&member.key),
                        value,
                        is_static: member.is_static,
                        is_private: member.is_private,
                    }
                }
                kind => {
                    let function = member.function.as_ref().expect("class member requires a function body");
                    let template = compile_function(function);
                    let template_index = self.register_template(template);
                    ClassMemberDescriptor {
                        kind: match kind {
                            ClassMemberKind::Method => MemberKind::Method,
                            ClassMemberKind::Getter => MemberKind::Getter,
                            ClassMemberKind::Setter => MemberKind::Setter,
                            ClassMemberKind::StaticInitializer => MemberKind::StaticInitializer,
                            ClassMemberKind::Field => unreachable!(),
                        },
                        key: self.intern_identifier(&member.key),
                        value: MemberValue::Template(template_index),
                        is_static: member.is_static,
                        is_private: member.is_private,
                    }
                }
            };
            members.push(descriptor);
        }

        let blueprint = self.register_blueprint(ClassBlueprint {
            name: node.name.clone(),
            constructor,
            members,
        });
        let superclass = node.superclass.as_ref().map(|s| {
            let value = self.compile_expr(s, None);
            self.copy_if_needed(value)
        });
        let dst = self.choose_dst(preferred);
        self.emit(Instruction::NewClass { dst, blueprint, superclass });
        dst
    }

    // ---- bindings and destructuring --------------------------------------

    fn emit_ident_assignment(&mut self, ident: &Ident, value: Operand, mode: BindingMode) {
        match ident.slot {
            Some(Slot::Local(index)) => {
                let local = self.local(index);
                self.emit_mov(local, value);
                if mode == BindingMode::Initialize {
                    self.set_local_initialized(index);
                }
            }
            Some(Slot::Argument(index)) => {
                let argument = self.argument(index);
                self.emit_mov(argument, value);
            }
            None => {
                let identifier = self.intern_identifier(&ident.name);
                let cache = self.next_environment_cache();
                self.emit(Instruction::SetVariable { identifier, src: value, mode, cache });
            }
        }
    }

    fn emit_binding_assignment(&mut self, target: &BindingTarget, value: Operand, mode: BindingMode) {
        match target {
            BindingTarget::Ident(ident) => self.emit_ident_assignment(ident, value, mode),
            BindingTarget::Pattern(pattern) => self.compile_pattern(pattern, value, mode),
        }
    }

    fn compile_pattern(&mut self, pattern: &Pattern, input: Operand, mode: BindingMode) {
        match pattern {
            Pattern::Array(elements) => self.compile_array_pattern(elements, input, mode),
            Pattern::Object(properties) => self.compile_object_pattern(properties, input, mode),
        }
    }

    // An exhausted iterator must never be stepped again, so a dedicated flag
    // register gates every step after the first: once the iterator reports
    // done, remaining targets bind undefined without touching it.
    fn compile_array_pattern(&mut self, elements: &[ArrayPatternElement], input: Operand, mode: BindingMode) {
        let is_exhausted = self.allocate_register();
        let false_constant = self.add_bool_constant(false);
        self.emit_mov(is_exhausted, false_constant);

        let iterator = self.allocate_register();
        self.emit(Instruction::GetIterator { dst: iterator, src: input, hint: IteratorHint::Sync });

        let mut first = true;
        let mut saw_rest = false;
        for element in elements {
            if element.rest {
                saw_rest = true;
                let value = self.allocate_register();
                if first {
                    self.emit(Instruction::IteratorToArray { dst: value, iterator });
                } else {
                    let if_exhausted = self.make_block();
                    let if_not_exhausted = self.make_block();
                    let continuation = self.make_block();
                    self.emit_jump_if(is_exhausted, if_exhausted, if_not_exhausted);
                    self.switch_to_block(if_exhausted);
                    self.emit(Instruction::NewArray { dst: value, elements: Box::new([]) });
                    self.emit(Instruction::Jump { target: continuation });
                    self.switch_to_block(if_not_exhausted);
                    self.emit(Instruction::IteratorToArray { dst: value, iterator });
                    self.emit(Instruction::Jump { target: continuation });
                    self.switch_to_block(continuation);
                }
                if let Some(target) = &element.target {
                    self.emit_binding_assignment(target, value, mode);
                }
                break;
            }

            let exhausted_block = self.make_block();
            if !first {
                let not_exhausted = self.make_block();
                self.emit_jump_if(is_exhausted, exhausted_block, not_exhausted);
                self.switch_to_block(not_exhausted);
            }

            let value = self.allocate_register();
            self.emit(Instruction::IteratorNextUnpack {
                value_dst: value,
                done_dst: is_exhausted,
                iterator,
            });
            // The step that discovers exhaustion must also bind undefined.
            let bind_block = self.make_block();
            let no_bail = self.make_block();
            self.emit_jump_if(is_exhausted, exhausted_block, no_bail);
            self.switch_to_block(no_bail);
            self.emit(Instruction::Jump { target: bind_block });

            self.switch_to_block(exhausted_block);
            let undefined = self.add_undefined_constant();
            self.emit_mov(value, undefined);
            self.emit(Instruction::Jump { target: bind_block });

            self.switch_to_block(bind_block);
            if let Some(default) = &element.default {
                let use_default = self.make_block();
                let no_default = self.make_block();
                self.emit(Instruction::JumpUndefined {
                    src: value,
                    true_target: use_default,
                    false_target: no_default,
                });
                self.switch_to_block(use_default);
                let default_value = self.compile_expr(default, None);
                self.emit_mov(value, default_value);
                self.emit(Instruction::Jump { target: no_default });
                self.switch_to_block(no_default);
            }
            if let Some(target) = &element.target {
                self.emit_binding_assignment(target, value, mode);
            }
            first = false;
        }

        if !saw_rest {
            let done_block = self.make_block();
            let not_done = self.make_block();
            self.emit_jump_if(is_exhausted, done_block, not_done);
            self.switch_to_block(not_done);
            let undefined = self.add_undefined_constant();
            self.emit(Instruction::IteratorClose {
                iterator,
                completion: CloseCompletion::Normal,
                value: undefined,
            });
            self.emit(Instruction::Jump { target: done_block });
            self.switch_to_block(done_block);
        }
    }

    fn compile_object_pattern(&mut self, properties: &[ObjectPatternProperty], input: Operand, mode: BindingMode) {
        for property in properties {
            let value = self.allocate_register();
            let identifier = self.intern_identifier(&property.key);
            let cache = self.next_property_cache();
            self.emit(Instruction::GetById { dst: value, base: input, property: identifier, cache });
            if let Some(default) = &property.default {
                let use_default = self.make_block();
                let no_default = self.make_block();
                self.emit(Instruction::JumpUndefined {
                    src: value,
                    true_target: use_default,
                    false_target: no_default,
                });
                self.switch_to_block(use_default);
                let default_value = self.compile_expr(default, None);
                self.emit_mov(value, default_value);
                self.emit(Instruction::Jump { target: no_default });
                self.switch_to_block(no_default);
            }
            self.emit_binding_assignment(&property.target, value, mode);
        }
    }

    fn emit_store_to_reference(&mut self, target: &Expr, value: Operand) {
        match target {
            Expr::Ident(ident) => self.emit_ident_assignment(ident, value, BindingMode::Set),
            Expr::Member(member) => {
                let base = self.compile_expr(&member.object, None);
                match &member.key {
                    MemberKey::Prop(name) => {
                        let property = self.intern_identifier(name);
                        let cache = self.next_property_cache();
                        self.emit(Instruction::PutById {
                            base,
                            property,
                            src: value,
                            kind: PropertyKind::Value,
                            cache,
                        });
                    }
                    MemberKey::Index(index) => {
                        let property = self.compile_expr(index, None);
                        self.emit(Instruction::PutByValue { base, property, src: value });
                    }
                }
            }
            _ => panic!("store target is not a reference expression"),
        }
    }

    // ---- expressions ------------------------------------------------------

    pub(crate) fn compile_expr(&mut self, expr: &Expr, preferred: Option<Operand>) -> Operand {
        if let Some(folded) = fold_expr(expr) {
            let constant = self.folded_operand(&folded);
            return self.into_preferred(constant, preferred);
        }
        match expr {
            Expr::Ident(ident) => self.compile_ident_load(ident, preferred),
            Expr::Number(n) => {
                let constant = self.add_number_constant(*n);
                self.into_preferred(constant, preferred)
            }
            Expr::Str(s) => {
                let constant = self.add_string_constant(s);
                self.into_preferred(constant, preferred)
            }
            Expr::Bool(b) => {
                let constant = self.add_bool_constant(*b);
                self.into_preferred(constant, preferred)
            }
            Expr::Null => {
                let constant = self.add_null_constant();
                self.into_preferred(constant, preferred)
            }
            Expr::Undefined => {
                let constant = self.add_undefined_constant();
                self.into_preferred(constant, preferred)
            }
            Expr::This => {
                let this = self.this_value();
                self.into_preferred(this, preferred)
            }
            Expr::Array(elements) => {
                let mut operands: SmallVec<[Operand; 8]> = SmallVec::with_capacity(elements.len());
                for element in elements {
                    let value = match element {
                        Some(expr) => {
                            let value = self.compile_expr(expr, None);
                            self.copy_if_needed(value)
                        }
                        None => self.add_undefined_constant(),
                    };
                    operands.push(value);
                }
                let dst = self.choose_dst(preferred);
                self.emit(Instruction::NewArray {
                    dst,
                    elements: operands.into_vec().into_boxed_slice(),
                });
                dst
            }
            Expr::Object(properties) => {
                let dst = self.choose_dst(preferred);
                self.emit(Instruction::NewObject { dst });
                for property in properties.iter() {
                    let value = self.compile_expr(&property.value, None);
                    let identifier = self.intern_identifier(&property.key);
                    let kind = match property.kind {
                        ObjectPropertyKind::Value => PropertyKind::Value,
                        ObjectPropertyKind::Getter => PropertyKind::Getter,
                        ObjectPropertyKind::Setter => PropertyKind::Setter,
                    };
                    let cache = self.next_property_cache();
                    self.emit(Instruction::PutById { base: dst, property: identifier, src: value, kind, cache });
                }
                dst
            }
            Expr::Function(node) => {
                let template = compile_function(node);
                let template_index = self.register_template(template);
                let dst = self.choose_dst(preferred);
                self.emit(Instruction::NewFunction { dst, template: template_index });
                dst
            }
            Expr::Class(node) => self.compile_class(node, preferred),
            Expr::Unary { op, operand } => self.compile_unary(*op, operand, preferred),
            Expr::Binary { op, lhs, rhs } => {
                let lhs_value = self.compile_expr(lhs, None);
                let lhs_value = self.copy_if_needed(lhs_value);
                let rhs_value = self.compile_expr(rhs, None);
                let dst = self.choose_dst(preferred);
                self.emit(binary_instruction(*op, dst, lhs_value, rhs_value));
                dst
            }
            Expr::Logical { op, lhs, rhs } => self.compile_logical(*op, lhs, rhs, preferred),
            Expr::Conditional { test, consequent, alternate } => {
                if let Some(folded) = fold_expr(test) {
                    let branch = if folded.is_truthy() { consequent } else { alternate };
                    return self.compile_expr(branch, preferred);
                }
                let test_value = self.compile_expr(test, None);
                let dst = self.choose_dst(preferred);
                let true_block = self.make_block();
                let false_block = self.make_block();
                let end_block = self.make_block();
                self.emit_jump_if(test_value, true_block, false_block);
                self.switch_to_block(true_block);
                self.compile_expr(consequent, Some(dst));
                self.emit(Instruction::Jump { target: end_block });
                self.switch_to_block(false_block);
                self.compile_expr(alternate, Some(dst));
                self.emit(Instruction::Jump { target: end_block });
                self.switch_to_block(end_block);
                dst
            }
            Expr::Assign { op, target, value } => self.compile_assignment(*op, target, value, preferred),
            Expr::Update { op, prefix, target } => self.compile_update(*op, *prefix, target, preferred),
            Expr::Member(member) => self.compile_member_load(member, preferred),
            Expr::Call(call) => self.compile_call(call, preferred),
            Expr::New(new) => {
                let callee = self.compile_expr(&new.callee, None);
                let callee = self.copy_if_needed(callee);
                let args = self.compile_arguments(&new.args);
                let dst = self.choose_dst(preferred);
                self.emit(Instruction::Construct { dst, callee, args });
                dst
            }
            Expr::Yield { argument, delegate } => {
                self.compile_yield(argument.as_deref(), *delegate, preferred)
            }
            Expr::Await(argument) => {
                debug_assert!(self.is_in_async_function());
                let value = self.compile_expr(argument, None);
                let result = self.generate_await_value(value);
                self.into_preferred(result, preferred)
            }
            Expr::Error(span) => panic!("no lowering rule for parse-error expression at {span:?}"),
        }
    }

    fn compile_ident_load(&mut self, ident: &Ident, preferred: Option<Operand>) -> Operand {
        match ident.slot {
            Some(Slot::Local(index)) => {
                let local = self.local(index);
                if self.local_is_lexical(index) && !self.is_local_initialized(index) {
                    let identifier = self.intern_identifier(&ident.name);
                    self.emit(Instruction::ThrowIfTdz { src: local, identifier });
                }
                self.into_preferred(local, preferred)
            }
            Some(Slot::Argument(index)) => {
                let argument = self.argument(index);
                self.into_preferred(argument, preferred)
            }
            None => {
                let dst = self.choose_dst(preferred);
                let identifier = self.intern_identifier(&ident.name);
                if self.identifier_is_global() {
                    let cache = self.next_global_cache();
                    self.emit(Instruction::GetGlobal { dst, identifier, cache });
                } else {
                    let cache = self.next_environment_cache();
                    self.emit(Instruction::GetVariable { dst, identifier, cache });
                }
                dst
            }
        }
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &Expr, preferred: Option<Operand>) -> Operand {
        match op {
            UnaryOp::Typeof => {
                if let Expr::Ident(ident) = operand {
                    if ident.slot.is_none() {
                        // typeof on an unresolvable binding yields
                        // "undefined" rather than throwing.
                        let dst = self.choose_dst(preferred);
                        let identifier = self.intern_identifier(&ident.name);
                        self.emit(Instruction::TypeofVariable { dst, identifier });
                        return dst;
                    }
                }
                let value = self.compile_expr(operand, None);
                let dst = self.choose_dst(preferred);
                self.emit(Instruction::Typeof { dst, src: value });
                dst
            }
            UnaryOp::Delete => match operand {
                Expr::Member(member) => {
                    let base = self.compile_expr(&member.object, None);
                    let dst = self.choose_dst(preferred);
                    match &member.key {
                        MemberKey::Prop(name) => {
                            let property = self.intern_identifier(name);
                            self.emit(Instruction::DeleteById { dst, base, property });
                        }
                        MemberKey::Index(index) => {
                            let property = self.compile_expr(index, None);
                            self.emit(Instruction::DeleteByValue { dst, base, property });
                        }
                    }
                    dst
                }
                _ => {
                    // Deleting a declared binding is refused.
                    self.compile_expr(operand, None);
                    let constant = self.add_bool_constant(false);
                    self.into_preferred(constant, preferred)
                }
            },
            UnaryOp::Void => {
                self.compile_expr(operand, None);
                let constant = self.add_undefined_constant();
                self.into_preferred(constant, preferred)
            }
            _ => {
                let value = self.compile_expr(operand, None);
                let dst = self.choose_dst(preferred);
                let instruction = match op {
                    UnaryOp::Minus => Instruction::UnaryMinus { dst, src: value },
                    UnaryOp::Plus => Instruction::UnaryPlus { dst, src: value },
                    UnaryOp::Not => Instruction::Not { dst, src: value },
                    UnaryOp::BitwiseNot => Instruction::BitwiseNot { dst, src: value },
                    UnaryOp::Typeof | UnaryOp::Void | UnaryOp::Delete => unreachable!(),
                };
                self.emit(instruction);
                dst
            }
        }
    }

    fn compile_logical(&mut self, op: LogicalOp, lhs: &Expr, rhs: &Expr, preferred: Option<Operand>) -> Operand {
        // A literal left side decides the branch statically.
        if let Some(folded) = fold_expr(lhs) {
            let takes_lhs = match op {
                LogicalOp::And => !folded.is_truthy(),
                LogicalOp::Or => folded.is_truthy(),
                LogicalOp::NullishCoalescing => !folded.is_nullish(),
            };
            if takes_lhs {
                let constant = self.folded_operand(&folded);
                return self.into_preferred(constant, preferred);
            }
            return self.compile_expr(rhs, preferred);
        }

        let dst = self.choose_dst(preferred);
        self.compile_expr(lhs, Some(dst));
        let rhs_block = self.make_block();
        let end_block = self.make_block();
        match op {
            LogicalOp::And => self.emit_jump_if(dst, rhs_block, end_block),
            LogicalOp::Or => self.emit_jump_if(dst, end_block, rhs_block),
            LogicalOp::NullishCoalescing => self.emit(Instruction::JumpNullish {
                src: dst,
                true_target: rhs_block,
                false_target: end_block,
            }),
        }
        self.switch_to_block(rhs_block);
        self.compile_expr(rhs, Some(dst));
        if !self.is_current_block_terminated() {
            self.emit(Instruction::Jump { target: end_block });
        }
        self.switch_to_block(end_block);
        dst
    }

    fn compile_assignment(&mut self, op: AssignOp, target: &Expr, value: &Expr, preferred: Option<Operand>) -> Operand {
        if op == AssignOp::Assign {
            return match target {
                Expr::Ident(ident) => {
                    let rhs = self.compile_expr(value, None);
                    self.emit_ident_assignment(ident, rhs, BindingMode::Set);
                    self.into_preferred(rhs, preferred)
                }
                Expr::Member(member) => {
                    // The member base is evaluated before the right-hand
                    // side and exactly once.
                    let base = self.compile_expr(&member.object, None);
                    let base = self.copy_if_needed(base);
                    match &member.key {
                        MemberKey::Prop(name) => {
                            let rhs = self.compile_expr(value, None);
                            let property = self.intern_identifier(name);
                            let cache = self.next_property_cache();
                            self.emit(Instruction::PutById {
                                base,
                                property,
                                src: rhs,
                                kind: PropertyKind::Value,
                                cache,
                            });
                            self.into_preferred(rhs, preferred)
                        }
                        MemberKey::Index(index) => {
                            let property = self.compile_expr(index, None);
                            let property = self.copy_if_needed(property);
                            let rhs = self.compile_expr(value, None);
                            self.emit(Instruction::PutByValue { base, property, src: rhs });
                            self.into_preferred(rhs, preferred)
                        }
                    }
                }
                _ => panic!("assignment target is not a reference expression"),
            };
        }

        let binary = assign_op_binary(op);
        match target {
            Expr::Ident(ident) => {
                let current = self.compile_ident_load(ident, None);
                let current = self.copy_if_needed(current);
                let rhs = self.compile_expr(value, None);
                let dst = self.choose_dst(preferred);
                self.emit(binary_instruction(binary, dst, current, rhs));
                self.emit_ident_assignment(ident, dst, BindingMode::Set);
                dst
            }
            Expr::Member(member) => {
                let base = self.compile_expr(&member.object, None);
                let base = self.copy_if_needed(base);
                match &member.key {
                    MemberKey::Prop(name) => {
                        let property = self.intern_identifier(name);
                        let current = self.allocate_register();
                        let read_cache = self.next_property_cache();
                        self.emit(Instruction::GetById { dst: current, base, property, cache: read_cache });
                        let rhs = self.compile_expr(value, None);
                        let dst = self.choose_dst(preferred);
                        self.emit(binary_instruction(binary, dst, current, rhs));
                        let write_cache = self.next_property_cache();
                        self.emit(Instruction::PutById {
                            base,
                            property,
                            src: dst,
                            kind: PropertyKind::Value,
                            cache: write_cache,
                        });
                        dst
                    }
                    MemberKey::Index(index) => {
                        let property = self.compile_expr(index, None);
                        let property = self.copy_if_needed(property);
                        let current = self.allocate_register();
                        self.emit(Instruction::GetByValue { dst: current, base, property });
                        let rhs = self.compile_expr(value, None);
                        let dst = self.choose_dst(preferred);
                        self.emit(binary_instruction(binary, dst, current, rhs));
                        self.emit(Instruction::PutByValue { base, property, src: dst });
                        dst
                    }
                }
            }
            _ => panic!("assignment target is not a reference expression"),
        }
    }

    fn compile_update(&mut self, op: UpdateOp, prefix: bool, target: &Expr, preferred: Option<Operand>) -> Operand {
        let one = self.add_number_constant(1.0);
        match target {
            Expr::Ident(ident) => {
                let current = self.compile_ident_load(ident, None);
                let old = self.allocate_register();
                self.emit(Instruction::UnaryPlus { dst: old, src: current });
                let new = self.allocate_register();
                match op {
                    UpdateOp::Increment => self.emit(Instruction::Add { dst: new, lhs: old, rhs: one }),
                    UpdateOp::Decrement => self.emit(Instruction::Sub { dst: new, lhs: old, rhs: one }),
                }
                self.emit_ident_assignment(ident, new, BindingMode::Set);
                let result = if prefix { new } else { old };
                self.into_preferred(result, preferred)
            }
            Expr::Member(member) => {
                let base = self.compile_expr(&member.object, None);
                let base = self.copy_if_needed(base);
                let (current, stored_property) = match &member.key {
                    MemberKey::Prop(name) => {
                        let property = self.intern_identifier(name);
                        let current = self.allocate_register();
                        let cache = self.next_property_cache();
                        self.emit(Instruction::GetById { dst: current, base, property, cache });
                        (current, None)
                    }
                    MemberKey::Index(index) => {
                        let property = self.compile_expr(index, None);
                        let property = self.copy_if_needed(property);
                        let current = self.allocate_register();
                        self.emit(Instruction::GetByValue { dst: current, base, property });
                        (current, Some(property))
                    }
                };
                let old = self.allocate_register();
                self.emit(Instruction::UnaryPlus { dst: old, src: current });
                let new = self.allocate_register();
                match op {
                    UpdateOp::Increment => self.emit(Instruction::Add { dst: new, lhs: old, rhs: one }),
                    UpdateOp::Decrement => self.emit(Instruction::Sub { dst: new, lhs: old, rhs: one }),
                }
                match &member.key {
                    MemberKey::Prop(name) => {
                        let property = self.intern_identifier(name);
                        let cache = self.next_property_cache();
                        self.emit(Instruction::PutById {
                            base,
                            property,
                            src: new,
                            kind: PropertyKind::Value,
                            cache,
                        });
                    }
                    MemberKey::Index(_) => {
                        let property = stored_property.unwrap();
                        self.emit(Instruction::PutByValue { base, property, src: new });
                    }
                }
                let result = if prefix { new } else { old };
                self.into_preferred(result, preferred)
            }
            _ => panic!("update target is not a reference expression"),
        }
    }

    fn compile_member_load(&mut self, member: &MemberExpr, preferred: Option<Operand>) -> Operand {
        let base = self.compile_expr(&member.object, None);

        if member.optional {
            let dst = self.choose_dst(preferred);
            let undefined_block = self.make_block();
            let access_block = self.make_block();
            let end_block = self.make_block();
            self.emit(Instruction::JumpNullish {
                src: base,
                true_target: undefined_block,
                false_target: access_block,
            });
            self.switch_to_block(undefined_block);
            let undefined = self.add_undefined_constant();
            self.emit_mov(dst, undefined);
            self.emit(Instruction::Jump { target: end_block });
            self.switch_to_block(access_block);
            self.emit_member_access(member, base, dst);
            self.emit(Instruction::Jump { target: end_block });
            self.switch_to_block(end_block);
            return dst;
        }

        let dst = self.choose_dst(preferred);
        self.emit_member_access(member, base, dst);
        dst
    }

    fn emit_member_access(&mut self, member: &MemberExpr, base: Operand, dst: Operand) {
        match &member.key {
            MemberKey::Prop(name) => {
                let property = self.intern_identifier(name);
                let cache = self.next_property_cache();
                self.emit(Instruction::GetById { dst, base, property, cache });
            }
            MemberKey::Index(index) => {
                let property = self.compile_expr(index, None);
                self.emit(Instruction::GetByValue { dst, base, property });
            }
        }
    }

    fn compile_arguments(&mut self, args: &[Expr]) -> Box<[Operand]> {
        let mut operands: SmallVec<[Operand; 8]> = SmallVec::with_capacity(args.len());
        for arg in args {
            let value = self.compile_expr(arg, None);
            operands.push(self.copy_if_needed(value));
        }
        operands.into_vec().into_boxed_slice()
    }

    fn compile_call(&mut self, call: &CallExpr, preferred: Option<Operand>) -> Operand {
        // A member callee supplies its base as the receiver; anything else
        // calls with an undefined receiver.
        let (callee, this_value) = match &call.callee {
            Expr::Member(member) if !member.optional => {
                let base = self.compile_expr(&member.object, None);
                let base = self.copy_if_needed(base);
                let function = self.allocate_register();
                self.emit_member_access(member, base, function);
                (function, base)
            }
            other => {
                let function = self.compile_expr(other, None);
                let function = self.copy_if_needed(function);
                let undefined = self.add_undefined_constant();
                (function, undefined)
            }
        };

        if call.optional {
            let dst = self.choose_dst(preferred);
            let skip_block = self.make_block();
            let call_block = self.make_block();
            let end_block = self.make_block();
            self.emit(Instruction::JumpNullish {
                src: callee,
                true_target: skip_block,
                false_target: call_block,
            });
            self.switch_to_block(skip_block);
            let undefined = self.add_undefined_constant();
            self.emit_mov(dst, undefined);
            self.emit(Instruction::Jump { target: end_block });
            self.switch_to_block(call_block);
            let args = self.compile_arguments(&call.args);
            self.emit(Instruction::Call { dst, callee, this_value, args });
            self.emit(Instruction::Jump { target: end_block });
            self.switch_to_block(end_block);
            return dst;
        }

        let args = self.compile_arguments(&call.args);
        let dst = self.choose_dst(preferred);
        self.emit(Instruction::Call { dst, callee, this_value, args });
        dst
    }

    // ---- suspension ------------------------------------------------------

    /// Suspend on a value and unpack the resumption completion on re-entry.
    /// A throw resumption re-raises at the suspension point; only a normal
    /// resumption continues with the value.
    fn generate_await_value(&mut self, argument: Operand) -> Operand {
        let continuation = self.make_block();
        self.emit(Instruction::Await { continuation, value: argument });
        self.switch_to_block(continuation);

        let received = self.allocate_register();
        let accumulator = self.accumulator();
        self.emit_mov(received, accumulator);
        let received_type = self.allocate_register();
        let received_value = self.allocate_register();
        self.emit(Instruction::GetCompletionFields {
            type_dst: received_type,
            value_dst: received_value,
            completion: received,
        });

        let normal_block = self.make_block();
        let throw_block = self.make_block();
        let normal = self.completion_constant(COMPLETION_NORMAL);
        self.emit(Instruction::JumpStrictlyEquals {
            lhs: received_type,
            rhs: normal,
            true_target: normal_block,
            false_target: throw_block,
        });
        self.switch_to_block(throw_block);
        self.perform_needed_unwinds();
        self.emit(Instruction::Throw { src: received_value });

        self.switch_to_block(normal_block);
        received_value
    }

    fn compile_yield(&mut self, argument: Option<&Expr>, delegate: bool, preferred: Option<Operand>) -> Operand {
        debug_assert!(self.is_in_generator_function());
        if delegate {
            let argument = argument.expect("delegated yield requires an iterable");
            return self.compile_yield_delegate(argument, preferred);
        }

        let value = match argument {
            Some(expr) => self.compile_expr(expr, None),
            None => self.add_undefined_constant(),
        };
        let value = if self.kind() == FunctionKind::AsyncGenerator {
            self.generate_await_value(value)
        } else {
            value
        };

        // Yielding inside a finalizer would clear a pending rethrow; stash
        // the exception register across the suspension.
        let saved_exception = if self.is_in_finalizer() {
            let register = self.allocate_register();
            self.emit_mov(register, Operand::Register(Register::EXCEPTION.0));
            Some(register)
        } else {
            None
        };

        let continuation = self.make_block();
        self.emit(Instruction::Yield { continuation: Some(continuation), value });
        self.switch_to_block(continuation);
        if let Some(saved) = saved_exception {
            self.emit_mov(Operand::Register(Register::EXCEPTION.0), saved);
        }

        let received = self.allocate_register();
        let accumulator = self.accumulator();
        self.emit_mov(received, accumulator);
        let received_type = self.allocate_register();
        let received_value = self.allocate_register();
        self.emit(Instruction::GetCompletionFields {
            type_dst: received_type,
            value_dst: received_value,
            completion: received,
        });

        // Resumed normally / via throw / via forced return, each routed to
        // the right continuation or unwind.
        let normal_block = self.make_block();
        let abrupt_block = self.make_block();
        let normal = self.completion_constant(COMPLETION_NORMAL);
        self.emit(Instruction::JumpStrictlyEquals {
            lhs: received_type,
            rhs: normal,
            true_target: normal_block,
            false_target: abrupt_block,
        });

        self.switch_to_block(abrupt_block);
        let throw_block = self.make_block();
        let return_block = self.make_block();
        let throw_constant = self.completion_constant(COMPLETION_THROW);
        self.emit(Instruction::JumpStrictlyEquals {
            lhs: received_type,
            rhs: throw_constant,
            true_target: throw_block,
            false_target: return_block,
        });

        self.switch_to_block(throw_block);
        self.perform_needed_unwinds();
        self.emit(Instruction::Throw { src: received_value });

        self.switch_to_block(return_block);
        self.emit_return(received_value);

        self.switch_to_block(normal_block);
        self.into_preferred(received_value, preferred)
    }

    // yield* drives the inner iterator with the resumption type it receives:
    // next/throw/return are forwarded on every delegated step, and each step
    // is itself a suspension point.
    fn compile_yield_delegate(&mut self, argument: &Expr, preferred: Option<Operand>) -> Operand {
        let value = self.compile_expr(argument, None);
        let iterator = self.allocate_register();
        self.emit(Instruction::GetIterator { dst: iterator, src: value, hint: IteratorHint::Sync });

        let received_type = self.allocate_register();
        let received_value = self.allocate_register();
        let normal = self.completion_constant(COMPLETION_NORMAL);
        self.emit_mov(received_type, normal);
        let undefined = self.add_undefined_constant();
        self.emit_mov(received_value, undefined);

        let result = self.allocate_register();

        let loop_block = self.make_block();
        let continuation_block = self.make_block();
        let loop_end = self.make_block();

        self.emit(Instruction::Jump { target: loop_block });
        self.switch_to_block(loop_block);

        let normal_branch = self.make_block();
        let abrupt_branch = self.make_block();
        self.emit(Instruction::JumpStrictlyEquals {
            lhs: received_type,
            rhs: normal,
            true_target: normal_branch,
            false_target: abrupt_branch,
        });

        // received.[[Type]] is normal: step the iterator forward.
        self.switch_to_block(normal_branch);
        let step_value = self.allocate_register();
        let step_done = self.allocate_register();
        self.emit(Instruction::IteratorResume {
            value_dst: step_value,
            done_dst: step_done,
            iterator,
            mode: ResumeMode::Next,
            argument: received_value,
        });
        let next_done = self.make_block();
        let next_not_done = self.make_block();
        self.emit_jump_if(step_done, next_done, next_not_done);
        self.switch_to_block(next_done);
        self.emit_mov(result, step_value);
        self.emit(Instruction::Jump { target: loop_end });
        self.switch_to_block(next_not_done);
        self.emit(Instruction::Yield { continuation: Some(continuation_block), value: step_value });

        self.switch_to_block(abrupt_branch);
        let throw_branch = self.make_block();
        let return_branch = self.make_block();
        let throw_constant = self.completion_constant(COMPLETION_THROW);
        self.emit(Instruction::JumpStrictlyEquals {
            lhs: received_type,
            rhs: throw_constant,
            true_target: throw_branch,
            false_target: return_branch,
        });

        // Forward a thrown resumption into the inner iterator; a completed
        // inner result becomes the value of the whole delegation.
        self.switch_to_block(throw_branch);
        let throw_value = self.allocate_register();
        let throw_done = self.allocate_register();
        self.emit(Instruction::IteratorResume {
            value_dst: throw_value,
            done_dst: throw_done,
            iterator,
            mode: ResumeMode::Throw,
            argument: received_value,
        });
        let throw_done_block = self.make_block();
        let throw_not_done = self.make_block();
        self.emit_jump_if(throw_done, throw_done_block, throw_not_done);
        self.switch_to_block(throw_done_block);
        self.emit_mov(result, throw_value);
        self.emit(Instruction::Jump { target: loop_end });
        self.switch_to_block(throw_not_done);
        self.emit(Instruction::Yield { continuation: Some(continuation_block), value: throw_value });

        // Forward a forced return; a completed inner result returns from the
        // outer generator through any enclosing finally scopes.
        self.switch_to_block(return_branch);
        let return_value = self.allocate_register();
        let return_done = self.allocate_register();
        self.emit(Instruction::IteratorResume {
            value_dst: return_value,
            done_dst: return_done,
            iterator,
            mode: ResumeMode::Return,
            argument: received_value,
        });
        let return_done_block = self.make_block();
        let return_not_done = self.make_block();
        self.emit_jump_if(return_done, return_done_block, return_not_done);
        self.switch_to_block(return_done_block);
        self.emit_return(return_value);
        self.switch_to_block(return_not_done);
        self.emit(Instruction::Yield { continuation: Some(continuation_block), value: return_value });

        // Every delegated yield resumes here and re-enters the loop with the
        // fresh completion.
        self.switch_to_block(continuation_block);
        let received = self.allocate_register();
        let accumulator = self.accumulator();
        self.emit_mov(received, accumulator);
        self.emit(Instruction::GetCompletionFields {
            type_dst: received_type,
            value_dst: received_value,
            completion: received,
        });
        self.emit(Instruction::Jump { target: loop_block });

        self.switch_to_block(loop_end);
        self.into_preferred(result, preferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Constant;

    fn number(n: f64) -> Expr {
        Expr::Number(n)
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    fn program_of(body: Vec<Stmt>) -> Program {
        Program { body: body.into_boxed_slice(), locals: Box::new([]) }
    }

    fn constant_number(executable: &Executable, operand: Operand) -> f64 {
        match operand {
            Operand::Constant(index) => match executable.constants[index as usize] {
                Constant::Number(n) => n,
                ref other => panic!("expected number constant, got {other:?}"),
            },
            other => panic!("expected constant operand, got {other:?}"),
        }
    }

    #[test]
    fn literal_arithmetic_folds_to_a_constant_load() {
        let program = program_of(vec![Stmt::Expr(binary(BinaryOp::Add, number(2.0), number(3.0)))]);
        let executable = compile_program(&program);
        assert!(
            !executable.instructions.iter().any(|i| matches!(i, Instruction::Add { .. })),
            "folded addition must not emit an arithmetic instruction"
        );
        let end_value = executable
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Mov { src, .. } => Some(*src),
                _ => None,
            })
            .last()
            .expect("completion mov");
        assert_eq!(constant_number(&executable, end_value), 5.0);
    }

    #[test]
    fn logical_chain_of_literals_folds_entirely() {
        // 0 || (1 && 2) folds to the constant 2.
        let inner = Expr::Logical {
            op: LogicalOp::And,
            lhs: Box::new(number(1.0)),
            rhs: Box::new(number(2.0)),
        };
        let expr = Expr::Logical {
            op: LogicalOp::Or,
            lhs: Box::new(number(0.0)),
            rhs: Box::new(inner),
        };
        let folded = fold_expr(&expr).expect("folds");
        assert_eq!(folded, Folded::Number(2.0));
    }

    #[test]
    fn bitwise_or_with_zero_truncates_to_int32() {
        let expr = binary(BinaryOp::BitwiseOr, number(4294967296.5), number(0.0));
        assert_eq!(fold_expr(&expr), Some(Folded::Number(0.0)));
        let expr = binary(BinaryOp::BitwiseOr, number(2147483648.0), number(0.0));
        assert_eq!(fold_expr(&expr), Some(Folded::Number(-2147483648.0)));
    }

    #[test]
    fn in_operator_is_never_folded() {
        let expr = binary(BinaryOp::In, Expr::Str("a".into()), Expr::Str("b".into()));
        assert_eq!(fold_expr(&expr), None);
    }

    #[test]
    fn division_by_zero_folds_to_infinity_not_an_error() {
        let expr = binary(BinaryOp::Div, number(1.0), number(0.0));
        assert_eq!(fold_expr(&expr), Some(Folded::Number(f64::INFINITY)));
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let program = program_of(vec![
            Stmt::Decl(Box::new(VarDecl {
                kind: DeclKind::Let,
                declarators: Box::new([Declarator {
                    target: BindingTarget::Ident(Box::new(Ident::local("x", 0))),
                    init: Some(binary(BinaryOp::Mul, number(6.0), number(7.0))),
                }]),
            })),
            Stmt::Expr(Expr::Ident(Box::new(Ident::local("x", 0)))),
        ]);
        let program = Program {
            body: program.body,
            locals: Box::new([LocalDecl { name: "x".into(), lexical: true }]),
        };
        let first = compile_program(&program);
        let second = compile_program(&program);
        assert_eq!(first.instructions, second.instructions);
        assert_eq!(first.constants, second.constants);
    }

    #[test]
    fn try_finally_emits_dispatch_chain() {
        let stmt = Stmt::Try(Box::new(TryStmt {
            block: Box::new([Stmt::Expr(number(1.0))]),
            handler: None,
            finalizer: Some(Box::new([Stmt::Expr(number(2.0))])),
        }));
        let executable = compile_program(&program_of(vec![stmt]));
        let strict_jumps = executable
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::JumpStrictlyEquals { .. }))
            .count();
        // NORMAL and RETURN checks at minimum.
        assert!(strict_jumps >= 2, "expected a dispatch chain, found {strict_jumps} checks");
        assert!(
            executable.instructions.iter().any(|i| matches!(i, Instruction::Catch { .. })),
            "exception preamble must capture into the completion value"
        );
        assert!(!executable.handlers.is_empty(), "try body must be covered by a handler range");
    }

    #[test]
    fn for_of_installs_iterator_close_on_abrupt_paths() {
        let stmt = Stmt::ForOf(Box::new(ForOfStmt {
            target: ForTarget::Decl {
                kind: DeclKind::Let,
                target: BindingTarget::Ident(Box::new(Ident::local("x", 0))),
            },
            iterable: Expr::Array(Box::new([Some(number(1.0))])),
            body: Box::new([Stmt::Break(None)]),
            is_await: false,
        }));
        let program = Program {
            body: Box::new([stmt]),
            locals: Box::new([LocalDecl { name: "x".into(), lexical: true }]),
        };
        let executable = compile_program(&program);
        let closes = executable
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::IteratorClose { .. }))
            .count();
        assert_eq!(closes, 2, "normal-abrupt and throw close paths");
        assert!(!executable.handlers.is_empty(), "loop body must be covered by the close finalizer");
    }
}
