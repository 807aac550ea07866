//! Iterator records and the step/resume/close services.
//!
//! Arrays, strings, property-name lists, generator activations, and plain
//! objects exposing a callable `next` all iterate through one record type.
//! A record that has reported completion is never stepped again; closing is
//! idempotent. Closing with a throw completion swallows errors from the
//! close itself so the original exception wins.

use quill_ir::{CloseCompletion, ResumeMode};

use crate::errors::messages;
use crate::heap::ManagedObject;
use crate::runtime::{ResumeKind, Runtime};
use crate::value::Value;

pub struct IteratorRecord {
    pub done: bool,
    pub kind: IteratorImpl,
}

pub enum IteratorImpl {
    /// Dense element iteration over an array-like object.
    Elements { object: Value, index: usize },
    StringChars { string: Value, index: usize },
    /// Pre-collected key list (for-in).
    PropertyNames { keys: Vec<Value>, index: usize },
    /// The full protocol: a user object with next/throw/return methods.
    Object { iterator: Value, next_method: Value },
    /// A generator or async activation driven through resumption.
    Activation { activation: Value },
}

impl Runtime {
    fn iterator_record(&self, value: Value) -> &IteratorRecord {
        match self.heap.get(value.as_obj_id()) {
            ManagedObject::Iterator(record) => record,
            _ => unreachable!("value is not an iterator record"),
        }
    }

    fn iterator_record_mut(&mut self, value: Value) -> &mut IteratorRecord {
        match self.heap.get_mut(value.as_obj_id()) {
            ManagedObject::Iterator(record) => record,
            _ => unreachable!("value is not an iterator record"),
        }
    }

    fn alloc_iterator(&mut self, kind: IteratorImpl) -> Value {
        let record = IteratorRecord { done: false, kind };
        Value::iterator(self.heap.alloc(ManagedObject::Iterator(Box::new(record))))
    }

    pub fn get_iterator(&mut self, value: Value) -> Result<Value, Value> {
        if value.is_string() {
            return Ok(self.alloc_iterator(IteratorImpl::StringChars { string: value, index: 0 }));
        }
        if value.is_activation() {
            return Ok(self.alloc_iterator(IteratorImpl::Activation { activation: value }));
        }
        if value.is_object() {
            if self.script_object(value.as_obj_id()).is_array {
                return Ok(self.alloc_iterator(IteratorImpl::Elements { object: value, index: 0 }));
            }
            let next_method = self.get_property(value, "next")?;
            if next_method.is_function() {
                return Ok(self.alloc_iterator(IteratorImpl::Object { iterator: value, next_method }));
            }
        }
        Err(self.throw_string(messages::NOT_ITERABLE))
    }

    /// The for-in source: own enumerable keys along the prototype chain,
    /// shadowed names reported once.
    pub fn get_property_iterator(&mut self, value: Value) -> Result<Value, Value> {
        let mut keys: Vec<Value> = Vec::new();
        if value.is_string() {
            let count = self.string_content(value).chars().count();
            let mut buffer = itoa::Buffer::new();
            for index in 0..count {
                let key = buffer.format(index).to_string();
                let key = self.alloc_string(key);
                keys.push(key);
            }
            return Ok(self.alloc_iterator(IteratorImpl::PropertyNames { keys, index: 0 }));
        }
        let mut seen: Vec<String> = Vec::new();
        let mut current = value;
        while current.is_object() {
            for key in self.own_enumerable_keys(current) {
                if !seen.contains(&key) {
                    seen.push(key);
                }
            }
            current = self.script_object(current.as_obj_id()).prototype;
        }
        for key in seen {
            let key = self.alloc_string(key);
            keys.push(key);
        }
        Ok(self.alloc_iterator(IteratorImpl::PropertyNames { keys, index: 0 }))
    }

    /// One protocol step, unpacked into (value, done). A completed record
    /// reports done without touching the underlying iterator again.
    pub fn iterator_step(&mut self, iterator: Value) -> Result<(Value, bool), Value> {
        self.iterator_drive(iterator, ResumeMode::Next, Value::UNDEFINED)
    }

    /// Drive the iterator with a resumption flavor; delegation forwards the
    /// outer resumption type on every step.
    pub fn iterator_resume(
        &mut self,
        iterator: Value,
        mode: ResumeMode,
        argument: Value,
    ) -> Result<(Value, bool), Value> {
        self.iterator_drive(iterator, mode, argument)
    }

    fn iterator_drive(
        &mut self,
        iterator: Value,
        mode: ResumeMode,
        argument: Value,
    ) -> Result<(Value, bool), Value> {
        if self.iterator_record(iterator).done {
            return match mode {
                ResumeMode::Next => Ok((Value::UNDEFINED, true)),
                ResumeMode::Throw => Err(argument),
                ResumeMode::Return => Ok((argument, true)),
            };
        }

        enum Step {
            Builtin,
            Object { target: Value, next_method: Value },
            Activation { activation: Value },
        }

        let step = match &self.iterator_record(iterator).kind {
            IteratorImpl::Elements { .. }
            | IteratorImpl::StringChars { .. }
            | IteratorImpl::PropertyNames { .. } => Step::Builtin,
            IteratorImpl::Object { iterator: target, next_method } => {
                Step::Object { target: *target, next_method: *next_method }
            }
            IteratorImpl::Activation { activation } => Step::Activation { activation: *activation },
        };

        match step {
            Step::Builtin => match mode {
                ResumeMode::Next => self.builtin_iterator_step(iterator),
                ResumeMode::Throw => {
                    self.iterator_record_mut(iterator).done = true;
                    Err(argument)
                }
                ResumeMode::Return => {
                    self.iterator_record_mut(iterator).done = true;
                    Ok((argument, true))
                }
            },
            Step::Object { target, next_method } => match mode {
                ResumeMode::Next => {
                    let result = self.call_function(next_method, target, &[argument])?;
                    self.unpack_iterator_result(iterator, result)
                }
                ResumeMode::Throw => {
                    let throw_method = self.get_property(target, "throw")?;
                    if !throw_method.is_function() {
                        self.iterator_close(iterator, CloseCompletion::Normal, Value::UNDEFINED)?;
                        return Err(self.throw_string(messages::ITERATOR_NO_THROW_METHOD));
                    }
                    let result = self.call_function(throw_method, target, &[argument])?;
                    self.unpack_iterator_result(iterator, result)
                }
                ResumeMode::Return => {
                    let return_method = self.get_property(target, "return")?;
                    if !return_method.is_function() {
                        self.iterator_record_mut(iterator).done = true;
                        return Ok((argument, true));
                    }
                    let result = self.call_function(return_method, target, &[argument])?;
                    self.unpack_iterator_result(iterator, result)
                }
            },
            Step::Activation { activation } => {
                let kind = match mode {
                    ResumeMode::Next => ResumeKind::Normal,
                    ResumeMode::Throw => ResumeKind::Throw,
                    ResumeMode::Return => ResumeKind::Return,
                };
                let (value, done) = self.resume_activation(activation, kind, argument)?;
                if done {
                    self.iterator_record_mut(iterator).done = true;
                }
                Ok((value, done))
            }
        }
    }

    fn builtin_iterator_step(&mut self, iterator: Value) -> Result<(Value, bool), Value> {
        enum Plan {
            Element { object: Value, index: usize },
            Char { string: Value, index: usize },
            Key(Option<Value>),
        }

        let plan = {
            let record = self.iterator_record_mut(iterator);
            match &mut record.kind {
                IteratorImpl::Elements { object, index } => {
                    let plan = Plan::Element { object: *object, index: *index };
                    *index += 1;
                    plan
                }
                IteratorImpl::StringChars { string, index } => {
                    let plan = Plan::Char { string: *string, index: *index };
                    *index += 1;
                    plan
                }
                IteratorImpl::PropertyNames { keys, index } => {
                    let value = keys.get(*index).copied();
                    *index += 1;
                    Plan::Key(value)
                }
                _ => unreachable!("builtin step on a protocol iterator"),
            }
        };

        let stepped = match plan {
            Plan::Element { object, index } => {
                self.script_object(object.as_obj_id()).elements.get(index).copied()
            }
            Plan::Char { string, index } => {
                let ch = self.string_content(string).chars().nth(index);
                ch.map(|ch| ch.to_string()).map(|text| self.alloc_string(text))
            }
            Plan::Key(value) => value,
        };
        match stepped {
            Some(value) => Ok((value, false)),
            None => {
                self.iterator_record_mut(iterator).done = true;
                Ok((Value::UNDEFINED, true))
            }
        }
    }

    fn unpack_iterator_result(&mut self, iterator: Value, result: Value) -> Result<(Value, bool), Value> {
        if !result.is_object() {
            return Err(self.throw_string(messages::ITERATOR_RESULT_NOT_OBJECT));
        }
        // The `done`/`value` reads may run getters; the result object is only
        // referenced from here until they finish.
        let (value, done) = self.with_temp_root(result, |rt| {
            let done_value = rt.get_property(result, "done")?;
            let done = rt.to_boolean(done_value);
            let value = rt.get_property(result, "value")?;
            Ok::<_, Value>((value, done))
        })?;
        if done {
            self.iterator_record_mut(iterator).done = true;
        }
        Ok((value, done))
    }

    /// Close the iterator exactly once. With a throw completion every error
    /// raised by the close steps is discarded; the caller rethrows the
    /// original exception afterwards.
    pub fn iterator_close(
        &mut self,
        iterator: Value,
        completion: CloseCompletion,
        _value: Value,
    ) -> Result<(), Value> {
        if self.iterator_record(iterator).done {
            return Ok(());
        }
        self.iterator_record_mut(iterator).done = true;

        enum Close {
            Nothing,
            Object { target: Value },
            Activation { activation: Value },
        }

        let close = match &self.iterator_record(iterator).kind {
            IteratorImpl::Object { iterator: target, .. } => Close::Object { target: *target },
            IteratorImpl::Activation { activation } => Close::Activation { activation: *activation },
            _ => Close::Nothing,
        };

        let swallow = matches!(completion, CloseCompletion::Throw);
        match close {
            Close::Nothing => Ok(()),
            Close::Object { target } => {
                let return_method = match self.get_property(target, "return") {
                    Ok(method) => method,
                    Err(error) => return if swallow { Ok(()) } else { Err(error) },
                };
                if return_method.is_nullish() || !return_method.is_function() {
                    return Ok(());
                }
                match self.call_function(return_method, target, &[]) {
                    Ok(result) => {
                        if !swallow && !result.is_object() {
                            return Err(self.throw_string(messages::ITERATOR_RESULT_NOT_OBJECT));
                        }
                        Ok(())
                    }
                    Err(error) => if swallow { Ok(()) } else { Err(error) },
                }
            }
            Close::Activation { activation } => {
                match self.resume_activation(activation, ResumeKind::Return, Value::UNDEFINED) {
                    Ok(_) => Ok(()),
                    Err(error) => if swallow { Ok(()) } else { Err(error) },
                }
            }
        }
    }

    /// Collected values accumulate in the temp-root stack: each step may run
    /// user bytecode, and nothing else references them yet.
    pub fn iterator_to_array(&mut self, iterator: Value) -> Result<Value, Value> {
        let mark = self.gc_temp_roots.len();
        let stepped = loop {
            match self.iterator_step(iterator) {
                Ok((_, true)) => break Ok(()),
                Ok((value, false)) => self.gc_temp_roots.push(value),
                Err(error) => break Err(error),
            }
        };
        let elements = self.gc_temp_roots.split_off(mark);
        stepped?;
        Ok(self.new_array(elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_iteration_steps_in_order_and_completes() {
        let mut rt = Runtime::new();
        let array = rt.new_array(vec![Value::from_i64(1), Value::from_i64(2)]);
        let iterator = rt.get_iterator(array).unwrap();
        assert_eq!(rt.iterator_step(iterator).unwrap(), (Value::from_i64(1), false));
        assert_eq!(rt.iterator_step(iterator).unwrap(), (Value::from_i64(2), false));
        assert_eq!(rt.iterator_step(iterator).unwrap(), (Value::UNDEFINED, true));
        // A completed record is never stepped again.
        assert_eq!(rt.iterator_step(iterator).unwrap(), (Value::UNDEFINED, true));
    }

    #[test]
    fn close_is_idempotent() {
        let mut rt = Runtime::new();
        let array = rt.new_array(vec![Value::from_i64(1)]);
        let iterator = rt.get_iterator(array).unwrap();
        rt.iterator_close(iterator, CloseCompletion::Normal, Value::UNDEFINED).unwrap();
        rt.iterator_close(iterator, CloseCompletion::Normal, Value::UNDEFINED).unwrap();
        assert_eq!(rt.iterator_step(iterator).unwrap(), (Value::UNDEFINED, true));
    }

    #[test]
    fn iterator_to_array_collects_remaining_values() {
        let mut rt = Runtime::new();
        let array = rt.new_array(vec![Value::from_i64(1), Value::from_i64(2), Value::from_i64(3)]);
        let iterator = rt.get_iterator(array).unwrap();
        let _ = rt.iterator_step(iterator).unwrap();
        let rest = rt.iterator_to_array(iterator).unwrap();
        let object = rt.script_object(rest.as_obj_id());
        assert_eq!(object.elements, vec![Value::from_i64(2), Value::from_i64(3)]);
    }

    #[test]
    fn non_iterable_values_fault() {
        let mut rt = Runtime::new();
        assert!(rt.get_iterator(Value::from_i64(3)).is_err());
        let object = rt.new_object();
        assert!(rt.get_iterator(object).is_err());
    }
}
