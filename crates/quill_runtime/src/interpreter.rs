//! The dispatch loop.
//!
//! One handler per instruction kind over the closed instruction enum,
//! executing until a terminal instruction is reached. Small-integer fast
//! paths skip the general coercion machinery when both operands already
//! carry the int tag. An instruction reporting an exception routes through
//! the executable's handler table (handler first, then finalizer) with the
//! exception stashed in the reserved register; with no covering range the
//! whole activation unwinds to its caller.

use smallvec::SmallVec;

use quill_ir::{
    to_int32, CloseCompletion, EnvironmentCache, Executable, GlobalCache, Instruction,
    PropertyCache, PropertyKind, Register, COMPLETION_NORMAL,
};

use crate::errors::messages;
use crate::frame::Frame;
use crate::heap::ManagedObject;
use crate::object::PropertySlot;
use crate::runtime::Runtime;
use crate::value::Value;

pub enum RunResult {
    Complete(Value),
    Thrown(Value),
    /// The resumption envelope: the produced value plus where to re-enter.
    /// No label means the activation finished with a return-style yield.
    Suspended { value: Value, resume_at: Option<usize> },
}

/// Stash the exception and find the covering handler table row.
fn throw_in_frame(frame: &mut Frame, executable: &Executable, offset: usize, error: Value) -> Option<usize> {
    frame.set_register(Register::EXCEPTION, error);
    let range = executable.handlers_for_offset(offset)?;
    range.handler.or(range.finalizer).map(|target| target as usize)
}

macro_rules! do_or_throw {
    ($frame:ident, $executable:ident, $ip:ident, $current:ident, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(error) => match throw_in_frame($frame, &$executable, $current, error) {
                Some(target) => {
                    $ip = target;
                    continue;
                }
                None => return RunResult::Thrown(error),
            },
        }
    };
}

macro_rules! raise {
    ($frame:ident, $executable:ident, $ip:ident, $current:ident, $error:expr) => {{
        let error = $error;
        match throw_in_frame($frame, &$executable, $current, error) {
            Some(target) => {
                $ip = target;
                continue;
            }
            None => return RunResult::Thrown(error),
        }
    }};
}

struct ActiveFrameGuard {
    rt: *mut Runtime,
}

impl Drop for ActiveFrameGuard {
    fn drop(&mut self) {
        unsafe {
            (*self.rt).active_frames.pop();
        }
    }
}

pub(crate) fn run_frame(rt: &mut Runtime, frame: &mut Frame, entry: usize) -> RunResult {
    let executable = frame.executable.clone();
    rt.active_frames.push(frame as *const Frame);
    let _registration = ActiveFrameGuard { rt: rt as *mut Runtime };

    let mut ip = entry;
    loop {
        rt.instruction_count = rt.instruction_count.wrapping_add(1);
        if rt.instruction_count & 1023 == 0 {
            rt.maybe_gc();
        }

        let current = ip;
        ip = current + 1;
        match &executable.instructions[current] {
            Instruction::Mov { dst, src } => {
                let value = frame.get(*src);
                frame.set(*dst, value);
            }

            // ---- arithmetic ---------------------------------------------
            Instruction::Add { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = if a.is_int() && b.is_int() {
                    Value::number((a.as_i64() + b.as_i64()) as f64)
                } else {
                    do_or_throw!(frame, executable, ip, current, rt.add_values(a, b))
                };
                frame.set(*dst, value);
            }
            Instruction::Sub { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = if a.is_int() && b.is_int() {
                    Value::number((a.as_i64() - b.as_i64()) as f64)
                } else {
                    do_or_throw!(frame, executable, ip, current, rt.sub_values(a, b))
                };
                frame.set(*dst, value);
            }
            Instruction::Mul { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = do_or_throw!(frame, executable, ip, current, rt.mul_values(a, b));
                frame.set(*dst, value);
            }
            Instruction::Div { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = do_or_throw!(frame, executable, ip, current, rt.div_values(a, b));
                frame.set(*dst, value);
            }
            Instruction::Mod { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = do_or_throw!(frame, executable, ip, current, rt.mod_values(a, b));
                frame.set(*dst, value);
            }
            Instruction::BitwiseAnd { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = do_or_throw!(frame, executable, ip, current, rt.int32_op(a, b, |x, y| x & y));
                frame.set(*dst, value);
            }
            Instruction::BitwiseOr { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = do_or_throw!(frame, executable, ip, current, rt.int32_op(a, b, |x, y| x | y));
                frame.set(*dst, value);
            }
            Instruction::BitwiseXor { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = do_or_throw!(frame, executable, ip, current, rt.int32_op(a, b, |x, y| x ^ y));
                frame.set(*dst, value);
            }
            Instruction::LeftShift { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value =
                    do_or_throw!(frame, executable, ip, current, rt.int32_op(a, b, |x, y| x << (y as u32 & 31)));
                frame.set(*dst, value);
            }
            Instruction::RightShift { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value =
                    do_or_throw!(frame, executable, ip, current, rt.int32_op(a, b, |x, y| x >> (y as u32 & 31)));
                frame.set(*dst, value);
            }
            Instruction::UnsignedRightShift { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let value = do_or_throw!(
                    frame,
                    executable,
                    ip,
                    current,
                    rt.int32_op(a, b, |x, y| ((x as u32) >> (y as u32 & 31)) as i32)
                );
                // The unsigned result must not re-wrap to a negative int32.
                let value = Value::number(value.as_number().rem_euclid(4294967296.0));
                frame.set(*dst, value);
            }

            // ---- comparisons --------------------------------------------
            Instruction::LessThan { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let result = if a.is_int() && b.is_int() {
                    a.as_i64() < b.as_i64()
                } else {
                    do_or_throw!(frame, executable, ip, current, rt.less_than(a, b))
                };
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::LessThanEquals { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let result = if a.is_int() && b.is_int() {
                    a.as_i64() <= b.as_i64()
                } else {
                    do_or_throw!(frame, executable, ip, current, rt.less_than_equals(a, b))
                };
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::GreaterThan { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let result = if a.is_int() && b.is_int() {
                    a.as_i64() > b.as_i64()
                } else {
                    do_or_throw!(frame, executable, ip, current, rt.greater_than(a, b))
                };
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::GreaterThanEquals { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let result = if a.is_int() && b.is_int() {
                    a.as_i64() >= b.as_i64()
                } else {
                    do_or_throw!(frame, executable, ip, current, rt.greater_than_equals(a, b))
                };
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::LooselyEquals { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let result = do_or_throw!(frame, executable, ip, current, rt.loose_equals(a, b));
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::LooselyInequals { dst, lhs, rhs } => {
                let a = frame.get(*lhs);
                let b = frame.get(*rhs);
                let result = do_or_throw!(frame, executable, ip, current, rt.loose_equals(a, b));
                frame.set(*dst, Value::from_bool(!result));
            }
            Instruction::StrictlyEquals { dst, lhs, rhs } => {
                let result = rt.strict_equals(frame.get(*lhs), frame.get(*rhs));
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::StrictlyInequals { dst, lhs, rhs } => {
                let result = rt.strict_equals(frame.get(*lhs), frame.get(*rhs));
                frame.set(*dst, Value::from_bool(!result));
            }
            Instruction::In { dst, lhs, rhs } => {
                let key = frame.get(*lhs);
                let object = frame.get(*rhs);
                let result = do_or_throw!(frame, executable, ip, current, rt.has_property(object, key));
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::InstanceOf { dst, lhs, rhs } => {
                let value = frame.get(*lhs);
                let target = frame.get(*rhs);
                let result = do_or_throw!(frame, executable, ip, current, rt.instance_of(value, target));
                frame.set(*dst, Value::from_bool(result));
            }

            // ---- unary ---------------------------------------------------
            Instruction::Not { dst, src } => {
                let value = rt.to_boolean(frame.get(*src));
                frame.set(*dst, Value::from_bool(!value));
            }
            Instruction::BitwiseNot { dst, src } => {
                let value = frame.get(*src);
                let number = do_or_throw!(frame, executable, ip, current, rt.to_number(value));
                frame.set(*dst, Value::number(!to_int32(number) as f64));
            }
            Instruction::UnaryMinus { dst, src } => {
                let value = frame.get(*src);
                let number = if value.is_int() {
                    -(value.as_i64() as f64)
                } else {
                    -do_or_throw!(frame, executable, ip, current, rt.to_number(value))
                };
                frame.set(*dst, Value::number(number));
            }
            Instruction::UnaryPlus { dst, src } => {
                let value = frame.get(*src);
                let number = if value.is_number() {
                    value.as_number()
                } else {
                    do_or_throw!(frame, executable, ip, current, rt.to_number(value))
                };
                frame.set(*dst, Value::number(number));
            }
            Instruction::Typeof { dst, src } => {
                let value = frame.get(*src);
                let name = rt.typeof_string(value);
                frame.set(*dst, name);
            }
            Instruction::TypeofVariable { dst, identifier } => {
                let name = executable.identifier(*identifier);
                let value = match rt.lookup_binding(frame.lexical_environment, name) {
                    Some((holder, _, slot)) => {
                        let binding = rt.env_binding_at(holder, slot).map(|(_, b)| b.value);
                        match binding {
                            Some(value) if !value.is_empty() => rt.typeof_string(value),
                            _ => rt.alloc_string("undefined"),
                        }
                    }
                    None => rt.alloc_string("undefined"),
                };
                frame.set(*dst, value);
            }

            // ---- property access ----------------------------------------
            Instruction::GetById { dst, base, property, cache } => {
                let base_value = frame.get(*base);
                let cell = executable.caches.borrow().property[*cache as usize];
                if cell.generation == rt.shape_generation {
                    let slot = PropertySlot { shape: cell.shape, offset: cell.offset };
                    if let Some(value) = rt.read_property_slot(base_value, slot) {
                        frame.set(*dst, value);
                        continue;
                    }
                }
                let name = executable.identifier(*property);
                let (value, slot) =
                    do_or_throw!(frame, executable, ip, current, rt.get_property_cached(base_value, name));
                if let Some(slot) = slot {
                    executable.caches.borrow_mut().property[*cache as usize] = PropertyCache {
                        shape: slot.shape,
                        generation: rt.shape_generation,
                        offset: slot.offset,
                    };
                }
                frame.set(*dst, value);
            }
            Instruction::PutById { base, property, src, kind, cache } => {
                let base_value = frame.get(*base);
                let value = frame.get(*src);
                match kind {
                    PropertyKind::Value => {
                        let cell = executable.caches.borrow().property[*cache as usize];
                        if cell.generation == rt.shape_generation {
                            let slot = PropertySlot { shape: cell.shape, offset: cell.offset };
                            if rt.write_property_slot(base_value, slot, value) {
                                continue;
                            }
                        }
                        let name = executable.identifier(*property);
                        let slot = do_or_throw!(
                            frame,
                            executable,
                            ip,
                            current,
                            rt.put_property_cached(base_value, name, value)
                        );
                        if let Some(slot) = slot {
                            executable.caches.borrow_mut().property[*cache as usize] = PropertyCache {
                                shape: slot.shape,
                                generation: rt.shape_generation,
                                offset: slot.offset,
                            };
                        }
                    }
                    PropertyKind::Getter | PropertyKind::Setter => {
                        let name = executable.identifier(*property);
                        let is_getter = matches!(kind, PropertyKind::Getter);
                        do_or_throw!(
                            frame,
                            executable,
                            ip,
                            current,
                            rt.define_accessor(base_value, name, value, is_getter)
                        );
                    }
                }
            }
            Instruction::GetByValue { dst, base, property } => {
                let base_value = frame.get(*base);
                let key = frame.get(*property);
                let value = do_or_throw!(frame, executable, ip, current, rt.get_by_value(base_value, key));
                frame.set(*dst, value);
            }
            Instruction::PutByValue { base, property, src } => {
                let base_value = frame.get(*base);
                let key = frame.get(*property);
                let value = frame.get(*src);
                do_or_throw!(frame, executable, ip, current, rt.put_by_value(base_value, key, value));
            }
            Instruction::DeleteById { dst, base, property } => {
                let base_value = frame.get(*base);
                let name = executable.identifier(*property);
                let result = do_or_throw!(frame, executable, ip, current, rt.delete_property(base_value, name));
                frame.set(*dst, Value::from_bool(result));
            }
            Instruction::DeleteByValue { dst, base, property } => {
                let base_value = frame.get(*base);
                let key = frame.get(*property);
                let result = do_or_throw!(frame, executable, ip, current, rt.delete_by_value(base_value, key));
                frame.set(*dst, Value::from_bool(result));
            }

            // ---- variables ----------------------------------------------
            Instruction::CreateVariable { identifier, immutable } => {
                let name = executable.identifier(*identifier);
                let environment = frame.lexical_environment;
                rt.env_declare(environment, name, !*immutable);
            }
            Instruction::GetVariable { dst, identifier, cache } => {
                let name = executable.identifier(*identifier);
                let cell = executable.caches.borrow().environment[*cache as usize];
                if cell.env_id != 0 {
                    if let Some(env) = rt.env_at_depth(frame.lexical_environment, cell.depth) {
                        if rt.env_record(env).id == cell.env_id {
                            if let Some((_, binding)) = rt.env_binding_at(env, cell.slot) {
                                if binding.value.is_empty() {
                                    raise!(
                                        frame,
                                        executable,
                                        ip,
                                        current,
                                        rt.throw_string(&messages::binding_not_initialized(name))
                                    );
                                }
                                frame.set(*dst, binding.value);
                                continue;
                            }
                        }
                    }
                }
                match rt.lookup_binding(frame.lexical_environment, name) {
                    Some((holder, depth, slot)) => {
                        let binding = rt.env_binding_at(holder, slot).map(|(_, b)| b.value);
                        let value = binding.unwrap_or(Value::UNDEFINED);
                        if value.is_empty() {
                            raise!(
                                frame,
                                executable,
                                ip,
                                current,
                                rt.throw_string(&messages::binding_not_initialized(name))
                            );
                        }
                        executable.caches.borrow_mut().environment[*cache as usize] = EnvironmentCache {
                            env_id: rt.env_record(holder).id,
                            depth,
                            slot,
                        };
                        frame.set(*dst, value);
                    }
                    None => raise!(
                        frame,
                        executable,
                        ip,
                        current,
                        rt.throw_string(&messages::undefined_binding(name))
                    ),
                }
            }
            Instruction::SetVariable { identifier, src, mode, cache } => {
                let name = executable.identifier(*identifier);
                let value = frame.get(*src);
                match mode {
                    quill_ir::BindingMode::Initialize => {
                        let environment = frame.lexical_environment;
                        do_or_throw!(
                            frame,
                            executable,
                            ip,
                            current,
                            rt.initialize_variable(environment, name, value)
                        );
                    }
                    quill_ir::BindingMode::Set => {
                        let cell = executable.caches.borrow().environment[*cache as usize];
                        let mut wrote = false;
                        if cell.env_id != 0 {
                            if let Some(env) = rt.env_at_depth(frame.lexical_environment, cell.depth) {
                                if rt.env_record(env).id == cell.env_id {
                                    if let Some((_, binding)) = rt.env_binding_at(env, cell.slot) {
                                        if binding.mutable && !binding.value.is_empty() {
                                            rt.env_record_mut(env).bindings[cell.slot as usize].value = value;
                                            wrote = true;
                                        }
                                    }
                                }
                            }
                        }
                        if !wrote {
                            match rt.lookup_binding(frame.lexical_environment, name) {
                                Some((holder, depth, slot)) => {
                                    let binding = rt.env_binding_at(holder, slot).map(|(_, b)| b);
                                    let binding = binding.expect("binding index from lookup");
                                    if binding.value.is_empty() {
                                        raise!(
                                            frame,
                                            executable,
                                            ip,
                                            current,
                                            rt.throw_string(&messages::binding_not_initialized(name))
                                        );
                                    }
                                    if !binding.mutable {
                                        raise!(
                                            frame,
                                            executable,
                                            ip,
                                            current,
                                            rt.throw_string(messages::ASSIGNMENT_TO_CONSTANT)
                                        );
                                    }
                                    rt.env_record_mut(holder).bindings[slot as usize].value = value;
                                    executable.caches.borrow_mut().environment[*cache as usize] =
                                        EnvironmentCache {
                                            env_id: rt.env_record(holder).id,
                                            depth,
                                            slot,
                                        };
                                }
                                None => {
                                    let global = rt.global_environment;
                                    rt.env_declare_initialized(global, name, value, true);
                                }
                            }
                        }
                    }
                }
            }
            Instruction::GetGlobal { dst, identifier, cache } => {
                let cell = executable.caches.borrow().global[*cache as usize];
                if cell.generation == rt.global_generation {
                    let global = rt.global_environment;
                    if let Some((_, binding)) = rt.env_binding_at(global, cell.slot) {
                        if !binding.value.is_empty() {
                            frame.set(*dst, binding.value);
                            continue;
                        }
                    }
                }
                let name = executable.identifier(*identifier);
                let global = rt.global_environment;
                let slot = rt.env_record(global).bindings.get_index_of(name);
                match slot {
                    Some(slot) => {
                        let binding = rt.env_record(global).bindings[slot].value;
                        if binding.is_empty() {
                            raise!(
                                frame,
                                executable,
                                ip,
                                current,
                                rt.throw_string(&messages::binding_not_initialized(name))
                            );
                        }
                        executable.caches.borrow_mut().global[*cache as usize] = GlobalCache {
                            generation: rt.global_generation,
                            slot: slot as u32,
                        };
                        frame.set(*dst, binding);
                    }
                    None => raise!(
                        frame,
                        executable,
                        ip,
                        current,
                        rt.throw_string(&messages::undefined_binding(name))
                    ),
                }
            }
            Instruction::ThrowIfTdz { src, identifier } => {
                if frame.get(*src).is_empty() {
                    let name = executable.identifier(*identifier);
                    raise!(
                        frame,
                        executable,
                        ip,
                        current,
                        rt.throw_string(&messages::binding_not_initialized(name))
                    );
                }
            }

            // ---- lexical environments -----------------------------------
            Instruction::CreateLexicalEnvironment => {
                frame.lexical_environment = rt.env_create(frame.lexical_environment);
            }
            Instruction::GetLexicalEnvironment { dst } => {
                let environment = frame.lexical_environment;
                frame.set(*dst, environment);
            }
            Instruction::SetLexicalEnvironment { src } => {
                frame.lexical_environment = frame.get(*src);
            }

            // ---- allocation ---------------------------------------------
            Instruction::NewObject { dst } => {
                let value = rt.new_object();
                frame.set(*dst, value);
            }
            Instruction::NewArray { dst, elements } => {
                let values: Vec<Value> = elements.iter().map(|operand| frame.get(*operand)).collect();
                let value = rt.new_array(values);
                frame.set(*dst, value);
            }
            Instruction::NewFunction { dst, template } => {
                let template = executable.templates[*template as usize].clone();
                let value = rt.new_function_from_template(template, frame.lexical_environment);
                frame.set(*dst, value);
            }
            Instruction::NewClass { dst, blueprint, superclass } => {
                let superclass = (*superclass).map(|operand| frame.get(operand));
                let blueprint = &executable.blueprints[*blueprint as usize];
                let value =
                    do_or_throw!(frame, executable, ip, current, rt.instantiate_class(frame, blueprint, superclass));
                frame.set(*dst, value);
            }

            // ---- calls ---------------------------------------------------
            Instruction::Call { dst, callee, this_value, args } => {
                let callee_value = frame.get(*callee);
                let this = frame.get(*this_value);
                let arguments: SmallVec<[Value; 8]> =
                    args.iter().map(|operand| frame.get(*operand)).collect();
                let value =
                    do_or_throw!(frame, executable, ip, current, rt.call_function(callee_value, this, &arguments));
                frame.set(*dst, value);
            }
            Instruction::Construct { dst, callee, args } => {
                let callee_value = frame.get(*callee);
                let arguments: SmallVec<[Value; 8]> =
                    args.iter().map(|operand| frame.get(*operand)).collect();
                let value =
                    do_or_throw!(frame, executable, ip, current, rt.construct(callee_value, &arguments));
                frame.set(*dst, value);
            }

            // ---- iterator protocol --------------------------------------
            Instruction::GetIterator { dst, src, hint: _ } => {
                let value = frame.get(*src);
                let iterator = do_or_throw!(frame, executable, ip, current, rt.get_iterator(value));
                frame.set(*dst, iterator);
            }
            Instruction::GetObjectPropertyIterator { dst, src } => {
                let value = frame.get(*src);
                let iterator = do_or_throw!(frame, executable, ip, current, rt.get_property_iterator(value));
                frame.set(*dst, iterator);
            }
            Instruction::IteratorNextUnpack { value_dst, done_dst, iterator } => {
                let iterator_value = frame.get(*iterator);
                let (value, done) =
                    do_or_throw!(frame, executable, ip, current, rt.iterator_step(iterator_value));
                frame.set(*value_dst, value);
                frame.set(*done_dst, Value::from_bool(done));
            }
            Instruction::IteratorResume { value_dst, done_dst, iterator, mode, argument } => {
                let iterator_value = frame.get(*iterator);
                let argument_value = frame.get(*argument);
                let (value, done) = do_or_throw!(
                    frame,
                    executable,
                    ip,
                    current,
                    rt.iterator_resume(iterator_value, *mode, argument_value)
                );
                frame.set(*value_dst, value);
                frame.set(*done_dst, Value::from_bool(done));
            }
            Instruction::IteratorClose { iterator, completion, value } => {
                let iterator_value = frame.get(*iterator);
                match completion {
                    CloseCompletion::Normal => {
                        do_or_throw!(
                            frame,
                            executable,
                            ip,
                            current,
                            rt.iterator_close(iterator_value, CloseCompletion::Normal, Value::UNDEFINED)
                        );
                    }
                    CloseCompletion::Throw => {
                        // Close errors are swallowed; the original exception
                        // always wins and is re-raised here.
                        let error = frame.get(*value);
                        let _ = rt.iterator_close(iterator_value, CloseCompletion::Throw, error);
                        raise!(frame, executable, ip, current, error);
                    }
                }
            }
            Instruction::IteratorToArray { dst, iterator } => {
                let iterator_value = frame.get(*iterator);
                let value = do_or_throw!(frame, executable, ip, current, rt.iterator_to_array(iterator_value));
                frame.set(*dst, value);
            }

            // ---- exceptions ---------------------------------------------
            Instruction::Catch { dst } => {
                let error = frame.register(Register::EXCEPTION);
                frame.set(*dst, error);
                frame.set_register(Register::EXCEPTION, Value::EMPTY);
            }
            Instruction::GetCompletionFields { type_dst, value_dst, completion } => {
                let completion_value = frame.get(*completion);
                let (kind, value) = if completion_value.is_completion() {
                    match rt.heap.get(completion_value.as_obj_id()) {
                        ManagedObject::Completion { kind, value } => (*kind, *value),
                        _ => unreachable!(),
                    }
                } else {
                    // A bare resumption value counts as a normal completion.
                    (COMPLETION_NORMAL, completion_value)
                };
                frame.set(*type_dst, Value::number(kind as f64));
                frame.set(*value_dst, value);
            }

            // ---- terminators --------------------------------------------
            Instruction::Jump { target } => {
                ip = target.0 as usize;
            }
            Instruction::JumpIf { condition, true_target, false_target } => {
                let taken = rt.to_boolean(frame.get(*condition));
                ip = (if taken { true_target.0 } else { false_target.0 }) as usize;
            }
            Instruction::JumpUndefined { src, true_target, false_target } => {
                let taken = frame.get(*src).is_undefined();
                ip = (if taken { true_target.0 } else { false_target.0 }) as usize;
            }
            Instruction::JumpNullish { src, true_target, false_target } => {
                let taken = frame.get(*src).is_nullish();
                ip = (if taken { true_target.0 } else { false_target.0 }) as usize;
            }
            Instruction::JumpStrictlyEquals { lhs, rhs, true_target, false_target } => {
                let taken = rt.strict_equals(frame.get(*lhs), frame.get(*rhs));
                ip = (if taken { true_target.0 } else { false_target.0 }) as usize;
            }
            Instruction::Throw { src } => {
                raise!(frame, executable, ip, current, frame.get(*src));
            }
            Instruction::Return { src } => {
                let value = frame.get(*src);
                frame.set_register(Register::RETURN_VALUE, value);
                return RunResult::Complete(value);
            }
            Instruction::Yield { continuation, value } => {
                let produced = frame.get(*value);
                return RunResult::Suspended {
                    value: produced,
                    resume_at: (*continuation).map(|label| label.0 as usize),
                };
            }
            Instruction::Await { continuation, value } => {
                let produced = frame.get(*value);
                return RunResult::Suspended {
                    value: produced,
                    resume_at: Some(continuation.0 as usize),
                };
            }
            Instruction::End { value } => {
                let produced = frame.get(*value);
                frame.set_register(Register::RETURN_VALUE, produced);
                return RunResult::Complete(produced);
            }
        }
    }
}
