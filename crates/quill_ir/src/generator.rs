//! Bytecode generation state: block arena, register allocation, intern
//! tables, scope stacks, and the try/finally completion machinery.
//!
//! Codegen proper (one lowering per AST node kind) lives in `astgen`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::block::BasicBlock;
use crate::cache::CacheTables;
use crate::executable::{
    ClassBlueprint, Executable, FunctionKind, FunctionTemplate, HandlerRange, LocalVariable,
};
use crate::instruction::{Constant, Instruction};
use crate::operand::{Label, Operand, Register};

/// Completion types for the finally dispatch protocol. Break/continue
/// targets registered with a finally context get indices from
/// `FIRST_JUMP_INDEX` upwards.
pub const COMPLETION_NORMAL: i32 = 0;
pub const COMPLETION_THROW: i32 = 1;
pub const COMPLETION_RETURN: i32 = 2;
pub const FIRST_JUMP_INDEX: i32 = 3;

/// Codegen-time state for one try/finally (or iterator-close) scope. Every
/// path into the finally body writes the completion record registers first;
/// the dispatch chain emitted after the finally body routes on them.
#[derive(Debug)]
pub struct FinallyContext {
    pub completion_type: Operand,
    pub completion_value: Operand,
    pub finally_body: Label,
    pub exception_preamble: Label,
    pub parent: Option<usize>,
    pub registered_jumps: Vec<(i32, Label)>,
    pub next_jump_index: i32,
    pub environment_at_entry: Operand,
}

/// Statement boundaries crossed by break/continue/return while unwinding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockBoundary {
    Break,
    Continue,
    ReturnToFinally,
    LeaveFinally,
    LeaveLexicalEnvironment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpType {
    Break,
    Continue,
}

#[derive(Debug)]
struct LabelableScope {
    target: Label,
    label_set: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default)]
struct UnwindFrame {
    handler: Option<Label>,
    finalizer: Option<Label>,
}

pub struct Generator {
    name: String,
    kind: FunctionKind,
    /// True while compiling a top-level program rather than a function body;
    /// unscoped identifier reads at the top level go through the global cache.
    program: bool,

    blocks: Vec<BasicBlock>,
    current_block: usize,

    next_register: u32,
    locals: Vec<LocalVariable>,
    argument_count: u32,
    initialized_locals: HashSet<u32>,

    constants: Vec<Constant>,
    number_constants: HashMap<u64, u32>,
    string_constants: HashMap<String, u32>,
    undefined_constant: Option<u32>,
    null_constant: Option<u32>,
    true_constant: Option<u32>,
    false_constant: Option<u32>,

    strings: Vec<String>,
    string_map: HashMap<String, u32>,
    identifiers: Vec<String>,
    identifier_map: HashMap<String, u32>,

    breakable_scopes: Vec<LabelableScope>,
    continuable_scopes: Vec<LabelableScope>,
    boundaries: Vec<BlockBoundary>,
    unwind_stack: Vec<UnwindFrame>,

    finally_contexts: Vec<FinallyContext>,
    current_finally: Option<usize>,

    /// Registers holding the lexical environment at each active scope depth;
    /// index 0 is the environment at activation entry.
    lexical_environment_registers: Vec<Operand>,

    pub(crate) templates: Vec<Rc<FunctionTemplate>>,
    pub(crate) blueprints: Vec<ClassBlueprint>,

    next_property_cache: u32,
    next_environment_cache: u32,
    next_global_cache: u32,
}

impl Generator {
    pub fn new(name: impl Into<String>, kind: FunctionKind, locals: Vec<LocalVariable>, argument_count: u32) -> Self {
        let mut generator = Self {
            name: name.into(),
            kind,
            program: false,
            blocks: Vec::new(),
            current_block: 0,
            next_register: Register::RESERVED_COUNT,
            locals,
            argument_count,
            initialized_locals: HashSet::new(),
            constants: Vec::new(),
            number_constants: HashMap::new(),
            string_constants: HashMap::new(),
            undefined_constant: None,
            null_constant: None,
            true_constant: None,
            false_constant: None,
            strings: Vec::new(),
            string_map: HashMap::new(),
            identifiers: Vec::new(),
            identifier_map: HashMap::new(),
            breakable_scopes: Vec::new(),
            continuable_scopes: Vec::new(),
            boundaries: Vec::new(),
            unwind_stack: Vec::new(),
            finally_contexts: Vec::new(),
            current_finally: None,
            lexical_environment_registers: Vec::new(),
            templates: Vec::new(),
            blueprints: Vec::new(),
            next_property_cache: 0,
            next_environment_cache: 0,
            next_global_cache: 0,
        };
        let entry = generator.make_block();
        generator.current_block = entry.0 as usize;
        generator
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn mark_program(&mut self) {
        self.program = true;
    }

    /// A top-level identifier with no surrounding variable scope can only be
    /// a global binding, so its lookup gets a global cache slot.
    pub fn identifier_is_global(&self) -> bool {
        self.program
            && !self
                .boundaries
                .iter()
                .any(|b| *b == BlockBoundary::LeaveLexicalEnvironment)
    }

    pub fn is_in_generator_function(&self) -> bool {
        self.kind.is_generator()
    }

    pub fn is_in_async_function(&self) -> bool {
        self.kind.is_async()
    }

    pub fn is_in_generator_or_async_function(&self) -> bool {
        self.kind != FunctionKind::Normal
    }

    pub fn is_in_finalizer(&self) -> bool {
        self.boundaries.contains(&BlockBoundary::LeaveFinally)
    }

    // ---- blocks ----------------------------------------------------------

    pub fn make_block(&mut self) -> Label {
        let frame = self.unwind_stack.last().copied().unwrap_or_default();
        self.make_block_with(frame.handler, frame.finalizer)
    }

    fn make_block_with(&mut self, handler: Option<Label>, finalizer: Option<Label>) -> Label {
        let id = self.blocks.len() as u32;
        self.blocks.push(BasicBlock::new(id, handler, finalizer));
        Label(id)
    }

    pub fn switch_to_block(&mut self, label: Label) {
        self.current_block = label.0 as usize;
    }

    pub fn current_block_label(&self) -> Label {
        Label(self.current_block as u32)
    }

    pub fn is_current_block_terminated(&self) -> bool {
        self.blocks[self.current_block].is_terminated()
    }

    pub fn emit(&mut self, instruction: Instruction) {
        // Dead code after a terminator lands in a fresh unreachable block so
        // the single-exit invariant holds.
        if self.blocks[self.current_block].is_terminated() {
            let next = self.make_block();
            self.current_block = next.0 as usize;
        }
        self.blocks[self.current_block].push(instruction);
    }

    pub fn emit_mov(&mut self, dst: Operand, src: Operand) {
        if dst != src {
            self.emit(Instruction::Mov { dst, src });
        }
    }

    pub fn emit_jump_if(&mut self, condition: Operand, true_target: Label, false_target: Label) {
        self.emit(Instruction::JumpIf { condition, true_target, false_target });
    }

    // ---- operands --------------------------------------------------------

    pub fn allocate_register(&mut self) -> Operand {
        let index = self.next_register;
        self.next_register += 1;
        Operand::Register(index)
    }

    pub fn choose_dst(&mut self, preferred: Option<Operand>) -> Operand {
        preferred.unwrap_or_else(|| self.allocate_register())
    }

    pub fn accumulator(&self) -> Operand {
        Register::ACCUMULATOR.into()
    }

    pub fn this_value(&self) -> Operand {
        Register::THIS_VALUE.into()
    }

    pub fn local(&self, index: u32) -> Operand {
        debug_assert!((index as usize) < self.locals.len());
        Operand::Local(index)
    }

    pub fn argument(&self, index: u32) -> Operand {
        debug_assert!(index < self.argument_count);
        Operand::Argument(index)
    }

    pub fn local_is_lexical(&self, index: u32) -> bool {
        self.locals[index as usize].lexical
    }

    /// Frame slot of a binding declared in this unit, by name. Used for
    /// function and class declarations, whose name binding carries no slot
    /// annotation of its own.
    pub fn lookup_local(&self, name: &str) -> Option<u32> {
        self.locals.iter().position(|l| l.name == name).map(|i| i as u32)
    }

    pub fn set_local_initialized(&mut self, index: u32) {
        self.initialized_locals.insert(index);
    }

    pub fn is_local_initialized(&self, index: u32) -> bool {
        self.initialized_locals.contains(&index)
    }

    // ---- constants and intern tables -------------------------------------

    fn push_constant(&mut self, constant: Constant) -> u32 {
        let index = self.constants.len() as u32;
        self.constants.push(constant);
        index
    }

    pub fn add_undefined_constant(&mut self) -> Operand {
        if self.undefined_constant.is_none() {
            self.undefined_constant = Some(self.push_constant(Constant::Undefined));
        }
        Operand::Constant(self.undefined_constant.unwrap())
    }

    pub fn add_null_constant(&mut self) -> Operand {
        if self.null_constant.is_none() {
            self.null_constant = Some(self.push_constant(Constant::Null));
        }
        Operand::Constant(self.null_constant.unwrap())
    }

    pub fn add_bool_constant(&mut self, value: bool) -> Operand {
        let slot = if value { &mut self.true_constant } else { &mut self.false_constant };
        if slot.is_none() {
            let index = self.constants.len() as u32;
            self.constants.push(Constant::Bool(value));
            *slot = Some(index);
        }
        let slot = if value { self.true_constant } else { self.false_constant };
        Operand::Constant(slot.unwrap())
    }

    pub fn add_number_constant(&mut self, value: f64) -> Operand {
        let bits = value.to_bits();
        if let Some(&index) = self.number_constants.get(&bits) {
            return Operand::Constant(index);
        }
        let index = self.push_constant(Constant::Number(value));
        self.number_constants.insert(bits, index);
        Operand::Constant(index)
    }

    pub fn add_string_constant(&mut self, value: &str) -> Operand {
        if let Some(&index) = self.string_constants.get(value) {
            return Operand::Constant(index);
        }
        let string_index = self.intern_string(value);
        let index = self.push_constant(Constant::Str(string_index));
        self.string_constants.insert(value.to_string(), index);
        Operand::Constant(index)
    }

    /// The constant behind a constant operand, if it is one.
    pub fn try_get_constant(&self, operand: Operand) -> Option<&Constant> {
        match operand {
            Operand::Constant(index) => Some(&self.constants[index as usize]),
            _ => None,
        }
    }

    pub fn intern_string(&mut self, value: &str) -> u32 {
        if let Some(&index) = self.string_map.get(value) {
            return index;
        }
        let index = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_map.insert(value.to_string(), index);
        index
    }

    pub fn intern_identifier(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.identifier_map.get(name) {
            return index;
        }
        let index = self.identifiers.len() as u32;
        self.identifiers.push(name.to_string());
        self.identifier_map.insert(name.to_string(), index);
        index
    }

    // ---- inline cache slots ----------------------------------------------

    pub fn next_property_cache(&mut self) -> u32 {
        let slot = self.next_property_cache;
        self.next_property_cache += 1;
        slot
    }

    pub fn next_environment_cache(&mut self) -> u32 {
        let slot = self.next_environment_cache;
        self.next_environment_cache += 1;
        slot
    }

    pub fn next_global_cache(&mut self) -> u32 {
        let slot = self.next_global_cache;
        self.next_global_cache += 1;
        slot
    }

    // ---- lexical environment tracking ------------------------------------

    /// Capture the current lexical environment into a register once per
    /// activation; nested scopes stack on top of it.
    pub fn ensure_lexical_environment_register(&mut self) -> Operand {
        if self.lexical_environment_registers.is_empty() {
            let reg = self.allocate_register();
            self.emit(Instruction::GetLexicalEnvironment { dst: reg });
            self.lexical_environment_registers.push(reg);
        }
        *self.lexical_environment_registers.last().unwrap()
    }

    pub fn begin_variable_scope(&mut self) {
        self.ensure_lexical_environment_register();
        self.emit(Instruction::CreateLexicalEnvironment);
        let reg = self.allocate_register();
        self.emit(Instruction::GetLexicalEnvironment { dst: reg });
        self.lexical_environment_registers.push(reg);
        self.start_boundary(BlockBoundary::LeaveLexicalEnvironment);
    }

    pub fn end_variable_scope(&mut self) {
        self.end_boundary(BlockBoundary::LeaveLexicalEnvironment);
        self.lexical_environment_registers.pop();
        if !self.is_current_block_terminated() {
            let outer = *self.lexical_environment_registers.last().unwrap();
            self.emit(Instruction::SetLexicalEnvironment { src: outer });
        }
    }

    // ---- unwind contexts --------------------------------------------------

    pub fn push_unwind_context(&mut self, handler: Option<Label>, finalizer: Option<Label>) {
        self.unwind_stack.push(UnwindFrame { handler, finalizer });
    }

    pub fn pop_unwind_context(&mut self) {
        self.unwind_stack.pop();
    }

    // ---- breakable/continuable scopes ------------------------------------

    pub fn begin_breakable_scope(&mut self, target: Label, label_set: Vec<String>) {
        self.breakable_scopes.push(LabelableScope { target, label_set });
        self.start_boundary(BlockBoundary::Break);
    }

    pub fn end_breakable_scope(&mut self) {
        self.end_boundary(BlockBoundary::Break);
        self.breakable_scopes.pop();
    }

    pub fn begin_continuable_scope(&mut self, target: Label, label_set: Vec<String>) {
        self.continuable_scopes.push(LabelableScope { target, label_set });
        self.start_boundary(BlockBoundary::Continue);
    }

    pub fn end_continuable_scope(&mut self) {
        self.end_boundary(BlockBoundary::Continue);
        self.continuable_scopes.pop();
    }

    pub fn start_boundary(&mut self, boundary: BlockBoundary) {
        self.boundaries.push(boundary);
    }

    pub fn end_boundary(&mut self, boundary: BlockBoundary) {
        let popped = self.boundaries.pop();
        debug_assert_eq!(popped, Some(boundary));
        let _ = boundary;
    }

    // ---- finally contexts -------------------------------------------------

    pub fn push_finally_context(&mut self, context: FinallyContext) -> usize {
        let index = self.finally_contexts.len();
        self.finally_contexts.push(context);
        self.current_finally = Some(index);
        index
    }

    pub fn current_finally_context(&self) -> Option<usize> {
        self.current_finally
    }

    pub fn set_current_finally_context(&mut self, context: Option<usize>) {
        self.current_finally = context;
    }

    pub fn finally_context(&self, index: usize) -> &FinallyContext {
        &self.finally_contexts[index]
    }

    /// Assign the next completion-type index for a break/continue target,
    /// record it with the context, and emit the entry into the finally body.
    pub fn register_jump_in_finally_context(&mut self, target: Label) {
        let index = self.current_finally.expect("no active finally context");
        let jump_index = self.finally_contexts[index].next_jump_index;
        self.finally_contexts[index].next_jump_index += 1;
        self.finally_contexts[index].registered_jumps.push((jump_index, target));
        let completion_type = self.finally_contexts[index].completion_type;
        let finally_body = self.finally_contexts[index].finally_body;
        let jump_constant = self.add_number_constant(jump_index as f64);
        self.emit_mov(completion_type, jump_constant);
        self.emit(Instruction::Jump { target: finally_body });
    }

    /// Break/continue through nested finally scopes chains via trampoline
    /// blocks: the inner dispatch routes to the trampoline, which enters the
    /// next outer finally.
    fn emit_trampoline_through_finally(&mut self) {
        let index = self.current_finally.expect("no active finally context");
        let parent = self.finally_contexts[index].parent;
        let parent_finalizer = parent.map(|p| self.finally_contexts[p].exception_preamble);
        let trampoline = self.make_block_with(None, parent_finalizer);
        self.register_jump_in_finally_context(trampoline);
        self.switch_to_block(trampoline);
        self.current_finally = parent;
    }

    /// Scans outward from a boundary looking for another finally scope
    /// between here and the jump target; if one exists the jump must chain
    /// through trampolines.
    fn has_outer_finally_before_target(&self, jump_type: JumpType, boundary_index: usize) -> bool {
        for j in (0..boundary_index.saturating_sub(1)).rev() {
            let inner = self.boundaries[j];
            match (jump_type, inner) {
                (JumpType::Break, BlockBoundary::Break) | (JumpType::Continue, BlockBoundary::Continue) => {
                    return false;
                }
                (_, BlockBoundary::ReturnToFinally) => return true,
                _ => {}
            }
        }
        false
    }

    pub fn generate_break(&mut self) {
        self.generate_scoped_jump(JumpType::Break);
    }

    pub fn generate_continue(&mut self) {
        self.generate_scoped_jump(JumpType::Continue);
    }

    fn generate_scoped_jump(&mut self, jump_type: JumpType) {
        let saved_finally = self.current_finally;
        let mut environment_offset = self.lexical_environment_registers.len();
        for i in (0..self.boundaries.len()).rev() {
            match self.boundaries[i] {
                BlockBoundary::Break if jump_type == JumpType::Break => {
                    let target = self.breakable_scopes.last().expect("break outside breakable scope").target;
                    self.emit(Instruction::Jump { target });
                    self.current_finally = saved_finally;
                    return;
                }
                BlockBoundary::Continue if jump_type == JumpType::Continue => {
                    let target = self.continuable_scopes.last().expect("continue outside continuable scope").target;
                    self.emit(Instruction::Jump { target });
                    self.current_finally = saved_finally;
                    return;
                }
                BlockBoundary::LeaveLexicalEnvironment => {
                    environment_offset -= 1;
                    let outer = self.lexical_environment_registers[environment_offset - 1];
                    self.emit(Instruction::SetLexicalEnvironment { src: outer });
                }
                BlockBoundary::ReturnToFinally => {
                    debug_assert!(self.current_finally.is_some());
                    if !self.has_outer_finally_before_target(jump_type, i + 1) {
                        let target = match jump_type {
                            JumpType::Break => self.breakable_scopes.last().expect("break outside breakable scope").target,
                            JumpType::Continue => self.continuable_scopes.last().expect("continue outside continuable scope").target,
                        };
                        self.register_jump_in_finally_context(target);
                        self.current_finally = saved_finally;
                        return;
                    }
                    self.emit_trampoline_through_finally();
                }
                _ => {}
            }
        }
        panic!("scoped jump found no target");
    }

    pub fn generate_labelled_break(&mut self, label: &str) {
        self.generate_labelled_jump(JumpType::Break, label);
    }

    pub fn generate_labelled_continue(&mut self, label: &str) {
        self.generate_labelled_jump(JumpType::Continue, label);
    }

    fn generate_labelled_jump(&mut self, jump_type: JumpType, label: &str) {
        let saved_finally = self.current_finally;
        let mut current_boundary = self.boundaries.len();
        let mut environment_offset = self.lexical_environment_registers.len();

        let scope_count = match jump_type {
            JumpType::Break => self.breakable_scopes.len(),
            JumpType::Continue => self.continuable_scopes.len(),
        };

        for scope_index in (0..scope_count).rev() {
            while current_boundary > 0 {
                let boundary = self.boundaries[current_boundary - 1];
                match boundary {
                    BlockBoundary::LeaveLexicalEnvironment => {
                        environment_offset -= 1;
                        let outer = self.lexical_environment_registers[environment_offset - 1];
                        self.emit(Instruction::SetLexicalEnvironment { src: outer });
                        current_boundary -= 1;
                    }
                    BlockBoundary::ReturnToFinally => {
                        debug_assert!(self.current_finally.is_some());
                        let scope_has_label = self.scope_label_set(jump_type, scope_index).contains(&label.to_string());
                        if !self.has_outer_finally_before_target(jump_type, current_boundary) && scope_has_label {
                            let target = self.scope_target(jump_type, scope_index);
                            self.register_jump_in_finally_context(target);
                            self.current_finally = saved_finally;
                            return;
                        }
                        self.emit_trampoline_through_finally();
                        current_boundary -= 1;
                    }
                    BlockBoundary::Break if jump_type == JumpType::Break => {
                        current_boundary -= 1;
                        break;
                    }
                    BlockBoundary::Continue if jump_type == JumpType::Continue => {
                        current_boundary -= 1;
                        break;
                    }
                    _ => {
                        current_boundary -= 1;
                    }
                }
            }

            if self.scope_label_set(jump_type, scope_index).iter().any(|l| l == label) {
                let target = self.scope_target(jump_type, scope_index);
                self.emit(Instruction::Jump { target });
                self.current_finally = saved_finally;
                return;
            }
        }
        panic!("labelled jump found no scope carrying label {label:?}");
    }

    fn scope_target(&self, jump_type: JumpType, index: usize) -> Label {
        match jump_type {
            JumpType::Break => self.breakable_scopes[index].target,
            JumpType::Continue => self.continuable_scopes[index].target,
        }
    }

    fn scope_label_set(&self, jump_type: JumpType, index: usize) -> &[String] {
        match jump_type {
            JumpType::Break => &self.breakable_scopes[index].label_set,
            JumpType::Continue => &self.continuable_scopes[index].label_set,
        }
    }

    pub fn attach_label_to_innermost_scopes(&mut self, label: &str) {
        if let Some(scope) = self.breakable_scopes.last_mut() {
            scope.label_set.push(label.to_string());
        }
        if let Some(scope) = self.continuable_scopes.last_mut() {
            scope.label_set.push(label.to_string());
        }
    }

    /// Emit the environment restores a non-jump terminator needs, stopping at
    /// the innermost finally scope (its body restores the rest).
    pub fn perform_needed_unwinds(&mut self) {
        let mut environment_offset = self.lexical_environment_registers.len();
        for i in (0..self.boundaries.len()).rev() {
            match self.boundaries[i] {
                BlockBoundary::LeaveLexicalEnvironment => {
                    environment_offset -= 1;
                    let outer = self.lexical_environment_registers[environment_offset - 1];
                    self.emit(Instruction::SetLexicalEnvironment { src: outer });
                }
                BlockBoundary::ReturnToFinally => return,
                _ => {}
            }
        }
    }

    /// Return from the activation, routing through any enclosing finally
    /// scope. Generators and async functions finish with a final yield so the
    /// driver observes a return-style envelope.
    pub fn emit_return(&mut self, value: Operand) {
        self.perform_needed_unwinds();
        if let Some(index) = self.current_finally {
            let completion_type = self.finally_contexts[index].completion_type;
            let completion_value = self.finally_contexts[index].completion_value;
            let finally_body = self.finally_contexts[index].finally_body;
            let return_constant = self.add_number_constant(COMPLETION_RETURN as f64);
            self.emit_mov(completion_value, value);
            self.emit_mov(completion_type, return_constant);
            self.emit(Instruction::Jump { target: finally_body });
            return;
        }
        if self.is_in_generator_or_async_function() {
            self.emit(Instruction::Yield { continuation: None, value });
        } else {
            self.emit(Instruction::Return { src: value });
        }
    }

    // ---- templates and blueprints ----------------------------------------

    pub fn register_template(&mut self, template: Rc<FunctionTemplate>) -> u32 {
        let index = self.templates.len() as u32;
        self.templates.push(template);
        index
    }

    pub fn register_blueprint(&mut self, blueprint: ClassBlueprint) -> u32 {
        let index = self.blueprints.len() as u32;
        self.blueprints.push(blueprint);
        index
    }

    // ---- linking ----------------------------------------------------------

    /// Flatten blocks in creation order, resolve labels to absolute offsets,
    /// and derive the exception handler table from the per-block stamps.
    pub fn finish(mut self) -> Executable {
        // Unterminated blocks fall through to the next block in program
        // order; the last one finishes the activation.
        for index in 0..self.blocks.len() {
            if !self.blocks[index].is_terminated() {
                let terminator = if index + 1 < self.blocks.len() {
                    Instruction::Jump { target: Label(index as u32 + 1) }
                } else {
                    match self.kind {
                        FunctionKind::Normal => Instruction::Return {
                            src: Operand::Register(Register::ACCUMULATOR.0),
                        },
                        _ => Instruction::Yield {
                            continuation: None,
                            value: Operand::Register(Register::ACCUMULATOR.0),
                        },
                    }
                };
                self.blocks[index].push(terminator);
            }
        }

        let mut block_offsets = Vec::with_capacity(self.blocks.len());
        let mut offset = 0u32;
        for block in &self.blocks {
            block_offsets.push(offset);
            offset += block.len() as u32;
        }

        let mut instructions = Vec::with_capacity(offset as usize);
        let mut handlers: Vec<HandlerRange> = Vec::new();
        for block in &mut self.blocks {
            let start = instructions.len() as u32;
            instructions.append(&mut block.instructions);
            let end = instructions.len() as u32;
            if start == end {
                continue;
            }
            if block.handler.is_some() || block.finalizer.is_some() {
                let handler = block.handler.map(|l| block_offsets[l.0 as usize]);
                let finalizer = block.finalizer.map(|l| block_offsets[l.0 as usize]);
                match handlers.last_mut() {
                    Some(last) if last.end == start && last.handler == handler && last.finalizer == finalizer => {
                        last.end = end;
                    }
                    _ => handlers.push(HandlerRange { start, end, handler, finalizer }),
                }
            }
        }

        for instruction in &mut instructions {
            instruction.for_each_label_mut(|label| label.0 = block_offsets[label.0 as usize]);
        }

        let caches = CacheTables::with_counts(
            self.next_property_cache,
            self.next_environment_cache,
            self.next_global_cache,
        );

        Executable {
            name: self.name,
            kind: self.kind,
            instructions,
            constants: self.constants,
            strings: self.strings,
            identifiers: self.identifiers,
            register_count: self.next_register,
            locals: self.locals,
            argument_count: self.argument_count,
            handlers,
            templates: self.templates,
            blueprints: self.blueprints,
            caches: RefCell::new(caches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_generator() -> Generator {
        Generator::new("test", FunctionKind::Normal, Vec::new(), 0)
    }

    #[test]
    fn registers_allocate_monotonically_after_reserved() {
        let mut generator = plain_generator();
        let a = generator.allocate_register();
        let b = generator.allocate_register();
        assert_eq!(a, Operand::Register(Register::RESERVED_COUNT));
        assert_eq!(b, Operand::Register(Register::RESERVED_COUNT + 1));
    }

    #[test]
    fn constants_are_deduplicated() {
        let mut generator = plain_generator();
        let a = generator.add_number_constant(42.0);
        let b = generator.add_number_constant(42.0);
        let c = generator.add_number_constant(43.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let s1 = generator.add_string_constant("hi");
        let s2 = generator.add_string_constant("hi");
        assert_eq!(s1, s2);
    }

    #[test]
    fn linking_resolves_labels_to_offsets() {
        let mut generator = plain_generator();
        let target = generator.make_block();
        generator.emit(Instruction::Jump { target });
        generator.switch_to_block(target);
        let value = generator.add_undefined_constant();
        generator.emit(Instruction::Return { src: value });
        let executable = generator.finish();
        match &executable.instructions[0] {
            Instruction::Jump { target } => assert_eq!(target.0, 1),
            other => panic!("expected jump, got {other:?}"),
        }
    }

    #[test]
    fn handler_stamps_become_table_rows() {
        let mut generator = plain_generator();
        let handler_block = generator.make_block();
        generator.push_unwind_context(Some(handler_block), None);
        let body = generator.make_block();
        generator.emit(Instruction::Jump { target: body });
        generator.switch_to_block(body);
        let value = generator.add_undefined_constant();
        generator.emit(Instruction::Mov { dst: Operand::Register(4), src: value });
        generator.emit(Instruction::Return { src: value });
        generator.pop_unwind_context();
        generator.switch_to_block(handler_block);
        generator.emit(Instruction::Return { src: value });
        let executable = generator.finish();
        assert_eq!(executable.handlers.len(), 1);
        let row = executable.handlers[0];
        assert!(row.handler.is_some());
        assert!(row.finalizer.is_none());
    }
}
