//! The engine runtime: globals, calls, class instantiation, generator/async
//! activation driving, and collection scheduling.

use std::rc::Rc;

use quill_ir::{
    ClassBlueprint, Executable, FunctionKind, FunctionTemplate, MemberKind, MemberValue, Operand,
    Register, COMPLETION_NORMAL, COMPLETION_RETURN, COMPLETION_THROW,
};

use crate::errors::messages;
use crate::frame::{ActivationState, Frame};
use crate::heap::{Heap, ManagedObject, ObjectId};
use crate::interpreter::{run_frame, RunResult};
use crate::object::{Accessor, ClassInfo, FastHashMap, FieldInit, FunctionObject, NativeFunction, Shape};
use crate::value::Value;

pub struct RuntimeConfig {
    pub max_call_depth: usize,
    /// Starting collection thresholds; sweeps retune them adaptively.
    pub gc_object_threshold: usize,
    pub gc_byte_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 512,
            gc_object_threshold: 100_000,
            gc_byte_threshold: 32 * 1024 * 1024,
        }
    }
}

/// How a suspended activation is being resumed. A forced return or throw is
/// how a driver cancels an activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeKind {
    Normal,
    Throw,
    Return,
}

impl ResumeKind {
    pub(crate) fn completion(self) -> i32 {
        match self {
            ResumeKind::Normal => COMPLETION_NORMAL,
            ResumeKind::Throw => COMPLETION_THROW,
            ResumeKind::Return => COMPLETION_RETURN,
        }
    }
}

pub struct Runtime {
    pub heap: Heap,
    pub global_environment: Value,
    pub(crate) root_shape: ObjectId,
    pub(crate) shape_generation: u64,
    pub(crate) global_generation: u64,
    pub(crate) next_environment_id: u64,
    pub(crate) call_depth: usize,
    pub(crate) instruction_count: usize,
    pub config: RuntimeConfig,
    /// Frames of the currently running activation chain, registered for GC
    /// root scanning while the dispatch loop is live.
    pub(crate) active_frames: Vec<*const Frame>,
    /// Heap values held only in engine locals across reentrant execution.
    pub(crate) gc_temp_roots: Vec<Value>,
    /// Host-visible value sink for native helpers and tests.
    pub sink: Vec<Value>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let mut heap = Heap::new();
        heap.gc_threshold = config.gc_object_threshold;
        heap.gc_threshold_bytes = config.gc_byte_threshold;
        let root_shape = heap.alloc(ManagedObject::Shape(Box::new(Shape {
            parent: None,
            prop_map: FastHashMap::default(),
            transitions: FastHashMap::default(),
        })));
        let mut rt = Self {
            heap,
            global_environment: Value::UNDEFINED,
            root_shape,
            shape_generation: 1,
            global_generation: 1,
            next_environment_id: 0,
            call_depth: 0,
            instruction_count: 0,
            config,
            active_frames: Vec::new(),
            gc_temp_roots: Vec::new(),
            sink: Vec::new(),
        };
        rt.global_environment = rt.env_create(Value::UNDEFINED);
        rt
    }

    // ---- entry points ----------------------------------------------------

    pub fn run_program(&mut self, executable: &Rc<Executable>) -> Result<Value, Value> {
        let environment = self.global_environment;
        let mut frame = Frame::new(self, executable.clone(), environment, Value::UNDEFINED, &[]);
        match run_frame(self, &mut frame, 0) {
            RunResult::Complete(value) => Ok(value),
            RunResult::Thrown(error) => Err(error),
            RunResult::Suspended { .. } => unreachable!("a top-level program cannot suspend"),
        }
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        let global = self.global_environment;
        self.env_declare_initialized(global, name, value, true);
    }

    pub fn get_global(&mut self, name: &str) -> Result<Value, Value> {
        let global = self.global_environment;
        self.get_variable(global, name)
    }

    pub fn new_native_function(&mut self, name: &str, native: NativeFunction) -> Value {
        let function = FunctionObject {
            name: name.to_string(),
            kind: FunctionKind::Normal,
            template: None,
            environment: self.global_environment,
            native: Some(native),
            properties: FastHashMap::default(),
            class_info: None,
        };
        Value::function(self.heap.alloc(ManagedObject::Function(Box::new(function))))
    }

    pub fn new_function_from_template(&mut self, template: Rc<FunctionTemplate>, environment: Value) -> Value {
        let function = FunctionObject {
            name: template.name.clone(),
            kind: template.kind,
            template: Some(template),
            environment,
            native: None,
            properties: FastHashMap::default(),
            class_info: None,
        };
        Value::function(self.heap.alloc(ManagedObject::Function(Box::new(function))))
    }

    // ---- calls -----------------------------------------------------------

    pub fn call_function(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, Value> {
        if !callee.is_function() {
            return Err(self.throw_string(messages::NOT_A_FUNCTION));
        }
        let (native, template, environment, kind) = {
            let function = self.function_object(callee.as_obj_id());
            (function.native, function.template.clone(), function.environment, function.kind)
        };
        if let Some(native) = native {
            return native(self, this, args);
        }
        let Some(template) = template else {
            // A class constructor with no body still constructs; calling it
            // as a plain function yields undefined.
            return Ok(Value::UNDEFINED);
        };
        match kind {
            FunctionKind::Normal => self.call_template(&template, environment, this, args),
            FunctionKind::Generator | FunctionKind::AsyncGenerator => {
                Ok(self.create_activation(&template, environment, this, args))
            }
            FunctionKind::Async => {
                // An async body starts eagerly and hands back a resumption
                // handle at its first suspension (or already finished).
                let activation = self.create_activation(&template, environment, this, args);
                match self.resume_activation(activation, ResumeKind::Normal, Value::UNDEFINED) {
                    Ok(_) => Ok(activation),
                    Err(error) => Err(error),
                }
            }
        }
    }

    pub(crate) fn call_template(
        &mut self,
        template: &Rc<FunctionTemplate>,
        environment: Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, Value> {
        // Running out of stack before starting a call is a catchable
        // program-level exception, not an engine abort.
        if self.call_depth >= self.config.max_call_depth {
            return Err(self.throw_string(messages::CALL_STACK_EXCEEDED));
        }
        self.call_depth += 1;
        let scope = self.env_create(environment);
        let mut frame = Frame::new(self, template.executable.clone(), scope, this, args);
        let result = run_frame(self, &mut frame, 0);
        self.call_depth -= 1;
        match result {
            RunResult::Complete(value) => Ok(value),
            RunResult::Thrown(error) => Err(error),
            RunResult::Suspended { .. } => unreachable!("a plain function cannot suspend"),
        }
    }

    fn create_activation(
        &mut self,
        template: &Rc<FunctionTemplate>,
        environment: Value,
        this: Value,
        args: &[Value],
    ) -> Value {
        let scope = self.env_create(environment);
        let frame = Frame::new(self, template.executable.clone(), scope, this, args);
        let state = ActivationState {
            kind: template.kind,
            frame: Some(Box::new(frame)),
            resume_at: 0,
            started: false,
            done: false,
            result: Value::UNDEFINED,
        };
        Value::activation(self.heap.alloc(ManagedObject::Activation(Box::new(state))))
    }

    fn activation_state_mut(&mut self, activation: Value) -> &mut ActivationState {
        match self.heap.get_mut(activation.as_obj_id()) {
            ManagedObject::Activation(state) => state,
            _ => unreachable!("value is not an activation"),
        }
    }

    /// Drive a suspended activation. Returns the produced value and whether
    /// the activation finished. Exactly one activation runs at a time; a
    /// suspended activation's frame is preserved until it resumes or is
    /// dropped.
    pub fn resume_activation(
        &mut self,
        activation: Value,
        kind: ResumeKind,
        value: Value,
    ) -> Result<(Value, bool), Value> {
        if !activation.is_activation() {
            return Err(self.throw_string(messages::NOT_A_FUNCTION));
        }
        let (done, started, resume_at, frame) = {
            let state = self.activation_state_mut(activation);
            (state.done, state.started, state.resume_at, state.frame.take())
        };

        if done {
            let result = {
                let state = self.activation_state_mut(activation);
                std::mem::replace(&mut state.result, Value::UNDEFINED)
            };
            return match kind {
                ResumeKind::Normal => Ok((result, true)),
                ResumeKind::Throw => Err(value),
                ResumeKind::Return => Ok((value, true)),
            };
        }
        let Some(mut frame) = frame else {
            return Err(self.throw_string(messages::ACTIVATION_ALREADY_RUNNING));
        };

        if !started {
            match kind {
                ResumeKind::Normal => {}
                ResumeKind::Throw => {
                    self.activation_state_mut(activation).done = true;
                    return Err(value);
                }
                ResumeKind::Return => {
                    self.activation_state_mut(activation).done = true;
                    return Ok((value, true));
                }
            }
        }
        self.activation_state_mut(activation).started = true;

        if self.call_depth >= self.config.max_call_depth {
            let state = self.activation_state_mut(activation);
            state.frame = Some(frame);
            return Err(self.throw_string(messages::CALL_STACK_EXCEEDED));
        }

        // The resumption completion arrives in the accumulator; the compiled
        // continuation unpacks it into a (type, value) pair.
        let completion = self.completion_cell(kind.completion(), value);
        frame.set_register(Register::ACCUMULATOR, completion);

        // The activation's frame is out of its state while running, so the
        // state object has to be rooted explicitly.
        self.call_depth += 1;
        let result = self.with_temp_root(activation, |rt| run_frame(rt, &mut frame, resume_at));
        self.call_depth -= 1;

        match result {
            RunResult::Complete(produced) => {
                let state = self.activation_state_mut(activation);
                state.done = true;
                state.result = produced;
                Ok((produced, true))
            }
            RunResult::Thrown(error) => {
                self.activation_state_mut(activation).done = true;
                Err(error)
            }
            RunResult::Suspended { value: produced, resume_at } => match resume_at {
                Some(at) => {
                    let state = self.activation_state_mut(activation);
                    state.frame = Some(frame);
                    state.resume_at = at;
                    Ok((produced, false))
                }
                None => {
                    let state = self.activation_state_mut(activation);
                    state.done = true;
                    state.result = produced;
                    Ok((produced, true))
                }
            },
        }
    }

    // ---- construction ----------------------------------------------------

    pub fn construct(&mut self, callee: Value, args: &[Value]) -> Result<Value, Value> {
        if !callee.is_function() {
            return Err(self.throw_string(messages::NOT_A_CONSTRUCTOR));
        }
        let prototype = self
            .function_object(callee.as_obj_id())
            .properties
            .get("prototype")
            .copied()
            .unwrap_or(Value::NULL);
        let instance = self.new_object_with_prototype(if prototype.is_object() {
            prototype
        } else {
            Value::NULL
        });
        let result = self.initialize_instance(callee, instance, args)?;
        Ok(if result.is_object() { result } else { instance })
    }

    /// Run the constructor chain against a fresh instance: superclass
    /// first, then this class's field initializers, then its constructor
    /// body.
    fn initialize_instance(&mut self, callee: Value, instance: Value, args: &[Value]) -> Result<Value, Value> {
        let (template, environment, class_fields, superclass) = {
            let function = self.function_object(callee.as_obj_id());
            let (fields, superclass) = match &function.class_info {
                Some(info) => {
                    let fields: Vec<(String, FieldInit)> = info
                        .fields
                        .iter()
                        .map(|(name, init)| {
                            let init = match init {
                                FieldInit::Constant(value) => FieldInit::Constant(*value),
                                FieldInit::Thunk(template) => FieldInit::Thunk(template.clone()),
                            };
                            (name.clone(), init)
                        })
                        .collect();
                    (fields, info.superclass)
                }
                None => (Vec::new(), Value::UNDEFINED),
            };
            (function.template.clone(), function.environment, fields, superclass)
        };

        if superclass.is_function() {
            self.initialize_instance(superclass, instance, args)?;
        }
        for (name, init) in class_fields {
            let value = match init {
                FieldInit::Constant(value) => value,
                FieldInit::Thunk(template) => {
                    self.call_template(&template, environment, instance, &[])?
                }
            };
            self.put_property(instance, &name, value)?;
        }
        match template {
            Some(template) => self.call_template(&template, environment, instance, args),
            None => Ok(Value::UNDEFINED),
        }
    }

    /// Instantiate a compile-time class blueprint into a constructor
    /// function, its prototype, and their members.
    pub(crate) fn instantiate_class(
        &mut self,
        frame: &Frame,
        blueprint: &ClassBlueprint,
        superclass: Option<Value>,
    ) -> Result<Value, Value> {
        if let Some(superclass) = superclass {
            if !superclass.is_function() && !superclass.is_null() {
                return Err(self.throw_string(messages::NOT_A_CONSTRUCTOR));
            }
        }
        let executable = frame.executable.clone();
        let environment = frame.lexical_environment;

        let parent_prototype = match superclass {
            Some(superclass) if superclass.is_function() => self
                .function_object(superclass.as_obj_id())
                .properties
                .get("prototype")
                .copied()
                .unwrap_or(Value::NULL),
            _ => Value::NULL,
        };
        let prototype = self.new_object_with_prototype(parent_prototype);

        let constructor_template = blueprint.constructor.map(|index| executable.templates[index as usize].clone());
        let constructor = FunctionObject {
            name: blueprint.name.clone().unwrap_or_default(),
            kind: FunctionKind::Normal,
            template: constructor_template,
            environment,
            native: None,
            properties: FastHashMap::default(),
            class_info: None,
        };
        let constructor_value =
            Value::function(self.heap.alloc(ManagedObject::Function(Box::new(constructor))));
        self.function_object_mut(constructor_value.as_obj_id())
            .properties
            .insert("prototype".to_string(), prototype);

        // Static field thunks and initializer blocks run bytecode while the
        // constructor is only referenced from here; keep it rooted (the
        // prototype is reachable through it).
        self.with_temp_root(constructor_value, |rt| {
            rt.put_property(prototype, "constructor", constructor_value)?;

            let mut fields: Vec<(String, FieldInit)> = Vec::new();
            let mut static_initializers: Vec<Rc<FunctionTemplate>> = Vec::new();

            for member in &blueprint.members {
                let base_key = executable.identifier(member.key);
                let key = if member.is_private { format!("#{base_key}") } else { base_key.to_string() };
                let target = if member.is_static { constructor_value } else { prototype };
                match member.kind {
                    MemberKind::Method => {
                        let template = match member.value {
                            MemberValue::Template(index) => executable.templates[index as usize].clone(),
                            MemberValue::Constant(_) => unreachable!("methods are templates"),
                        };
                        let method = rt.new_function_from_template(template, environment);
                        if member.is_static {
                            rt.function_object_mut(constructor_value.as_obj_id())
                                .properties
                                .insert(key, method);
                        } else {
                            rt.put_property(target, &key, method)?;
                        }
                    }
                    MemberKind::Getter | MemberKind::Setter => {
                        let template = match member.value {
                            MemberValue::Template(index) => executable.templates[index as usize].clone(),
                            MemberValue::Constant(_) => unreachable!("accessors are templates"),
                        };
                        let function = rt.new_function_from_template(template, environment);
                        let is_getter = member.kind == MemberKind::Getter;
                        if member.is_static {
                            rt.define_function_accessor(constructor_value, &key, function, is_getter);
                        } else {
                            rt.define_accessor(target, &key, function, is_getter)?;
                        }
                    }
                    MemberKind::Field => {
                        let init = match member.value {
                            MemberValue::Constant(index) => {
                                FieldInit::Constant(frame.get(Operand::Constant(index)))
                            }
                            MemberValue::Template(index) => {
                                FieldInit::Thunk(executable.templates[index as usize].clone())
                            }
                        };
                        if member.is_static {
                            let value = match init {
                                FieldInit::Constant(value) => value,
                                FieldInit::Thunk(template) => {
                                    rt.call_template(&template, environment, constructor_value, &[])?
                                }
                            };
                            rt.function_object_mut(constructor_value.as_obj_id())
                                .properties
                                .insert(key, value);
                        } else {
                            fields.push((key, init));
                        }
                    }
                    MemberKind::StaticInitializer => {
                        let template = match member.value {
                            MemberValue::Template(index) => executable.templates[index as usize].clone(),
                            MemberValue::Constant(_) => unreachable!("static initializers are templates"),
                        };
                        static_initializers.push(template);
                    }
                }
            }

            rt.function_object_mut(constructor_value.as_obj_id()).class_info = Some(Box::new(ClassInfo {
                superclass: superclass.unwrap_or(Value::UNDEFINED),
                fields,
            }));

            for template in static_initializers {
                rt.call_template(&template, environment, constructor_value, &[])?;
            }
            Ok(())
        })?;

        Ok(constructor_value)
    }

    fn define_function_accessor(&mut self, function: Value, key: &str, value: Value, is_getter: bool) {
        let existing = self.function_object(function.as_obj_id()).properties.get(key).copied();
        match existing {
            Some(existing) if existing.is_accessor() => match self.heap.get_mut(existing.as_obj_id()) {
                ManagedObject::Accessor(accessor) => {
                    if is_getter {
                        accessor.getter = value;
                    } else {
                        accessor.setter = value;
                    }
                }
                _ => unreachable!(),
            },
            _ => {
                let accessor = Accessor {
                    getter: if is_getter { value } else { Value::UNDEFINED },
                    setter: if is_getter { Value::UNDEFINED } else { value },
                };
                let accessor =
                    Value::accessor(self.heap.alloc(ManagedObject::Accessor(Box::new(accessor))));
                self.function_object_mut(function.as_obj_id())
                    .properties
                    .insert(key.to_string(), accessor);
            }
        }
    }

    /// Keep a value alive across reentrant execution it is otherwise only
    /// referenced from engine locals during.
    pub(crate) fn with_temp_root<T>(&mut self, value: Value, f: impl FnOnce(&mut Self) -> T) -> T {
        self.gc_temp_roots.push(value);
        let result = f(self);
        self.gc_temp_roots.pop();
        result
    }

    // ---- collection ------------------------------------------------------

    /// Runs only at the dispatch-loop checkpoint, when every live value is
    /// reachable from the registered roots.
    pub(crate) fn maybe_gc(&mut self) {
        if !self.heap.should_gc() {
            return;
        }
        let mut roots = vec![self.global_environment];
        roots.extend_from_slice(&self.gc_temp_roots);
        roots.extend_from_slice(&self.sink);
        let frames: Vec<&Frame> = self
            .active_frames
            .iter()
            .map(|pointer| unsafe { &**pointer })
            .collect();
        self.heap.mark_all(&roots, &frames);
        drop(frames);
        self.heap.sweep();
    }
}
