//! The shape-based object model.
//!
//! Objects store named property values in a flat vector whose layout is
//! described by a shape; shapes form a transition tree so objects built the
//! same way share layouts. Integer-keyed properties live in a separate
//! element vector. Property caches are validated by shape identity plus the
//! global shape generation, which is bumped by layout-destroying operations
//! (deletes), never assumed valid by call-site identity alone.

use std::rc::Rc;

use hashbrown::HashMap;

use quill_ir::{FunctionKind, FunctionTemplate};

use crate::errors::messages;
use crate::heap::{ManagedObject, ObjectId};
use crate::runtime::Runtime;
use crate::value::Value;

pub type FastHashMap<K, V> = HashMap<K, V, ahash::RandomState>;

/// Integer keys below this bound use the element vector.
pub const ELEMENTS_MAX: usize = 65536;

pub struct Shape {
    pub parent: Option<ObjectId>,
    pub prop_map: FastHashMap<String, u32>,
    pub transitions: FastHashMap<String, ObjectId>,
}

pub struct ScriptObject {
    pub shape: ObjectId,
    pub prop_values: Vec<Value>,
    pub elements: Vec<Value>,
    pub prototype: Value,
    pub is_array: bool,
}

pub struct Accessor {
    pub getter: Value,
    pub setter: Value,
}

pub type NativeFunction = fn(&mut Runtime, Value, &[Value]) -> Result<Value, Value>;

pub enum FieldInit {
    Constant(Value),
    Thunk(Rc<FunctionTemplate>),
}

pub struct ClassInfo {
    pub superclass: Value,
    pub fields: Vec<(String, FieldInit)>,
}

pub struct FunctionObject {
    pub name: String,
    pub kind: FunctionKind,
    pub template: Option<Rc<FunctionTemplate>>,
    pub environment: Value,
    pub native: Option<NativeFunction>,
    /// "prototype", "name", statics; functions carry few properties so a
    /// plain map beats shapes here.
    pub properties: FastHashMap<String, Value>,
    pub class_info: Option<Box<ClassInfo>>,
}

/// Where a cached property lookup found its value: an own data property at
/// a fixed offset under a specific shape.
#[derive(Clone, Copy, Debug)]
pub struct PropertySlot {
    pub shape: u64,
    pub offset: u32,
}

impl Runtime {
    pub(crate) fn script_object(&self, id: ObjectId) -> &ScriptObject {
        match self.heap.get(id) {
            ManagedObject::Object(object) => object,
            _ => unreachable!("value is not a script object"),
        }
    }

    pub(crate) fn script_object_mut(&mut self, id: ObjectId) -> &mut ScriptObject {
        match self.heap.get_mut(id) {
            ManagedObject::Object(object) => object,
            _ => unreachable!("value is not a script object"),
        }
    }

    pub(crate) fn function_object(&self, id: ObjectId) -> &FunctionObject {
        match self.heap.get(id) {
            ManagedObject::Function(function) => function,
            _ => unreachable!("value is not a function object"),
        }
    }

    pub(crate) fn function_object_mut(&mut self, id: ObjectId) -> &mut FunctionObject {
        match self.heap.get_mut(id) {
            ManagedObject::Function(function) => function,
            _ => unreachable!("value is not a function object"),
        }
    }

    fn shape(&self, id: ObjectId) -> &Shape {
        match self.heap.get(id) {
            ManagedObject::Shape(shape) => shape,
            _ => unreachable!("value is not a shape"),
        }
    }

    pub fn new_object(&mut self) -> Value {
        let shape = self.root_shape;
        let object = ScriptObject {
            shape,
            prop_values: Vec::new(),
            elements: Vec::new(),
            prototype: Value::NULL,
            is_array: false,
        };
        Value::object(self.heap.alloc(ManagedObject::Object(Box::new(object))))
    }

    pub fn new_object_with_prototype(&mut self, prototype: Value) -> Value {
        let value = self.new_object();
        self.script_object_mut(value.as_obj_id()).prototype = prototype;
        value
    }

    pub fn new_array(&mut self, elements: Vec<Value>) -> Value {
        let shape = self.root_shape;
        let object = ScriptObject {
            shape,
            prop_values: Vec::new(),
            elements,
            prototype: Value::NULL,
            is_array: true,
        };
        Value::object(self.heap.alloc(ManagedObject::Object(Box::new(object))))
    }

    pub fn alloc_string(&mut self, text: impl Into<String>) -> Value {
        Value::string(self.heap.alloc(ManagedObject::Str(text.into())))
    }

    pub fn string_content(&self, value: Value) -> &str {
        match self.heap.get(value.as_obj_id()) {
            ManagedObject::Str(s) => s,
            _ => unreachable!("value is not a string"),
        }
    }

    pub(crate) fn throw_string(&mut self, message: &str) -> Value {
        self.alloc_string(message)
    }

    fn shape_lookup(&self, shape: ObjectId, name: &str) -> Option<u32> {
        self.shape(shape).prop_map.get(name).copied()
    }

    /// Find or create the shape reached by adding one property.
    fn shape_transition(&mut self, shape: ObjectId, name: &str) -> ObjectId {
        if let Some(&next) = self.shape(shape).transitions.get(name) {
            return next;
        }
        let mut prop_map = self.shape(shape).prop_map.clone();
        let offset = prop_map.len() as u32;
        prop_map.insert(name.to_string(), offset);
        let next = self.heap.alloc(ManagedObject::Shape(Box::new(Shape {
            parent: Some(shape),
            prop_map,
            transitions: FastHashMap::default(),
        })));
        match self.heap.get_mut(shape) {
            ManagedObject::Shape(s) => {
                s.transitions.insert(name.to_string(), next);
            }
            _ => unreachable!(),
        }
        next
    }

    // ---- property reads --------------------------------------------------

    pub fn get_property(&mut self, base: Value, name: &str) -> Result<Value, Value> {
        self.get_property_cached(base, name).map(|(value, _)| value)
    }

    /// Property read that also reports a cacheable own-data-property slot.
    pub fn get_property_cached(
        &mut self,
        base: Value,
        name: &str,
    ) -> Result<(Value, Option<PropertySlot>), Value> {
        if base.is_nullish() {
            return Err(self.throw_string(messages::NULLISH_PROPERTY_ACCESS));
        }
        if base.is_string() {
            if name == "length" {
                let length = self.string_content(base).chars().count();
                return Ok((Value::from_i64(length as i64), None));
            }
            return Ok((Value::UNDEFINED, None));
        }
        if base.is_function() {
            let function = self.function_object(base.as_obj_id());
            if name == "name" && !function.properties.contains_key("name") {
                let text = function.name.clone();
                let value = self.alloc_string(text);
                return Ok((value, None));
            }
            let value = function.properties.get(name).copied().unwrap_or(Value::UNDEFINED);
            if value.is_accessor() {
                let getter = match self.heap.get(value.as_obj_id()) {
                    ManagedObject::Accessor(accessor) => accessor.getter,
                    _ => unreachable!(),
                };
                if getter.is_nullish() {
                    return Ok((Value::UNDEFINED, None));
                }
                let result = self.call_function(getter, base, &[])?;
                return Ok((result, None));
            }
            return Ok((value, None));
        }
        if !base.is_object() {
            // Number and boolean primitives have no own properties here.
            return Ok((Value::UNDEFINED, None));
        }

        let mut current = base;
        let mut on_receiver = true;
        while current.is_object() {
            let object = self.script_object(current.as_obj_id());
            if object.is_array && name == "length" {
                let length = object.elements.len();
                return Ok((Value::from_i64(length as i64), None));
            }
            let shape = object.shape;
            if let Some(offset) = self.shape_lookup(shape, name) {
                let value = self.script_object(current.as_obj_id()).prop_values[offset as usize];
                if value.is_accessor() {
                    let getter = match self.heap.get(value.as_obj_id()) {
                        ManagedObject::Accessor(accessor) => accessor.getter,
                        _ => unreachable!(),
                    };
                    if getter.is_nullish() {
                        return Ok((Value::UNDEFINED, None));
                    }
                    let result = self.call_function(getter, base, &[])?;
                    return Ok((result, None));
                }
                let slot = on_receiver.then_some(PropertySlot { shape: shape.0 as u64, offset });
                return Ok((value, slot));
            }
            current = self.script_object(current.as_obj_id()).prototype;
            on_receiver = false;
        }
        Ok((Value::UNDEFINED, None))
    }

    /// Fast-path read through a validated cache slot.
    pub(crate) fn read_property_slot(&self, base: Value, slot: PropertySlot) -> Option<Value> {
        if !base.is_object() {
            return None;
        }
        let object = self.script_object(base.as_obj_id());
        if object.shape.0 as u64 != slot.shape {
            return None;
        }
        let value = *object.prop_values.get(slot.offset as usize)?;
        // Accessors are never cached.
        if value.is_accessor() {
            return None;
        }
        Some(value)
    }

    // ---- property writes -------------------------------------------------

    pub fn put_property(&mut self, base: Value, name: &str, value: Value) -> Result<(), Value> {
        self.put_property_cached(base, name, value).map(|_| ())
    }

    pub fn put_property_cached(
        &mut self,
        base: Value,
        name: &str,
        value: Value,
    ) -> Result<Option<PropertySlot>, Value> {
        if base.is_nullish() {
            return Err(self.throw_string(messages::NULLISH_PROPERTY_WRITE));
        }
        if base.is_function() {
            self.function_object_mut(base.as_obj_id())
                .properties
                .insert(name.to_string(), value);
            return Ok(None);
        }
        if !base.is_object() {
            // Writes to other primitives are silently dropped.
            return Ok(None);
        }

        if self.script_object(base.as_obj_id()).is_array && name == "length" {
            let new_length = value.as_number().max(0.0) as usize;
            self.script_object_mut(base.as_obj_id())
                .elements
                .resize(new_length, Value::UNDEFINED);
            return Ok(None);
        }

        // A setter anywhere on the chain intercepts the write.
        let mut current = base;
        while current.is_object() {
            let object = self.script_object(current.as_obj_id());
            let shape = object.shape;
            if let Some(offset) = self.shape_lookup(shape, name) {
                let existing = self.script_object(current.as_obj_id()).prop_values[offset as usize];
                if existing.is_accessor() {
                    let setter = match self.heap.get(existing.as_obj_id()) {
                        ManagedObject::Accessor(accessor) => accessor.setter,
                        _ => unreachable!(),
                    };
                    if setter.is_nullish() {
                        return Ok(None);
                    }
                    self.call_function(setter, base, &[value])?;
                    return Ok(None);
                }
                if current == base {
                    self.script_object_mut(base.as_obj_id()).prop_values[offset as usize] = value;
                    return Ok(Some(PropertySlot { shape: shape.0 as u64, offset }));
                }
                // A data property on the chain shadows: define own below.
                break;
            }
            current = self.script_object(current.as_obj_id()).prototype;
        }

        let shape = self.script_object(base.as_obj_id()).shape;
        let next = self.shape_transition(shape, name);
        let object = self.script_object_mut(base.as_obj_id());
        object.shape = next;
        object.prop_values.push(value);
        Ok(None)
    }

    /// Fast-path write through a validated cache slot. Only overwrites of
    /// existing own data properties qualify.
    pub(crate) fn write_property_slot(&mut self, base: Value, slot: PropertySlot, value: Value) -> bool {
        if !base.is_object() {
            return false;
        }
        let object = self.script_object(base.as_obj_id());
        if object.shape.0 as u64 != slot.shape {
            return false;
        }
        let Some(existing) = object.prop_values.get(slot.offset as usize) else {
            return false;
        };
        if existing.is_accessor() {
            return false;
        }
        self.script_object_mut(base.as_obj_id()).prop_values[slot.offset as usize] = value;
        true
    }

    pub fn define_accessor(
        &mut self,
        base: Value,
        name: &str,
        function: Value,
        is_getter: bool,
    ) -> Result<(), Value> {
        if !base.is_object() {
            return Err(self.throw_string(messages::NOT_AN_OBJECT));
        }
        let shape = self.script_object(base.as_obj_id()).shape;
        if let Some(offset) = self.shape_lookup(shape, name) {
            let existing = self.script_object(base.as_obj_id()).prop_values[offset as usize];
            if existing.is_accessor() {
                match self.heap.get_mut(existing.as_obj_id()) {
                    ManagedObject::Accessor(accessor) => {
                        if is_getter {
                            accessor.getter = function;
                        } else {
                            accessor.setter = function;
                        }
                    }
                    _ => unreachable!(),
                }
                return Ok(());
            }
            let accessor = self.alloc_accessor(function, is_getter);
            self.script_object_mut(base.as_obj_id()).prop_values[offset as usize] = accessor;
            return Ok(());
        }
        let accessor = self.alloc_accessor(function, is_getter);
        let next = self.shape_transition(shape, name);
        let object = self.script_object_mut(base.as_obj_id());
        object.shape = next;
        object.prop_values.push(accessor);
        Ok(())
    }

    fn alloc_accessor(&mut self, function: Value, is_getter: bool) -> Value {
        let accessor = Accessor {
            getter: if is_getter { function } else { Value::UNDEFINED },
            setter: if is_getter { Value::UNDEFINED } else { function },
        };
        Value::accessor(self.heap.alloc(ManagedObject::Accessor(Box::new(accessor))))
    }

    // ---- deletes ---------------------------------------------------------

    /// Removing a property rebuilds the object's layout outside the
    /// transition tree and invalidates every property cache via the global
    /// generation.
    pub fn delete_property(&mut self, base: Value, name: &str) -> Result<bool, Value> {
        if base.is_nullish() {
            return Err(self.throw_string(messages::NULLISH_PROPERTY_ACCESS));
        }
        if base.is_function() {
            let removed = self.function_object_mut(base.as_obj_id()).properties.remove(name);
            return Ok(removed.is_some());
        }
        if !base.is_object() {
            return Ok(true);
        }
        let shape = self.script_object(base.as_obj_id()).shape;
        let Some(removed_offset) = self.shape_lookup(shape, name) else {
            return Ok(true);
        };

        let mut remaining: Vec<(String, u32)> = self
            .shape(shape)
            .prop_map
            .iter()
            .filter(|(key, _)| key.as_str() != name)
            .map(|(key, offset)| (key.clone(), *offset))
            .collect();
        remaining.sort_by_key(|(_, offset)| *offset);

        let mut prop_map = FastHashMap::default();
        for (index, (key, _)) in remaining.iter().enumerate() {
            prop_map.insert(key.clone(), index as u32);
        }
        let fresh = self.heap.alloc(ManagedObject::Shape(Box::new(Shape {
            parent: None,
            prop_map,
            transitions: FastHashMap::default(),
        })));

        let object = self.script_object_mut(base.as_obj_id());
        object.prop_values.remove(removed_offset as usize);
        object.shape = fresh;
        self.shape_generation += 1;
        Ok(true)
    }

    // ---- keyed access ----------------------------------------------------

    fn element_index(key: Value) -> Option<usize> {
        if key.is_int() {
            let index = key.as_i64();
            if (0..ELEMENTS_MAX as i64).contains(&index) {
                return Some(index as usize);
            }
        }
        None
    }

    pub fn get_by_value(&mut self, base: Value, key: Value) -> Result<Value, Value> {
        if base.is_nullish() {
            return Err(self.throw_string(messages::NULLISH_PROPERTY_ACCESS));
        }
        if let Some(index) = Self::element_index(key) {
            if base.is_string() {
                let ch = self.string_content(base).chars().nth(index);
                return Ok(match ch {
                    Some(ch) => self.alloc_string(ch.to_string()),
                    None => Value::UNDEFINED,
                });
            }
            if base.is_object() {
                let object = self.script_object(base.as_obj_id());
                return Ok(object.elements.get(index).copied().unwrap_or(Value::UNDEFINED));
            }
        }
        let name = self.to_property_key(key)?;
        self.get_property(base, &name)
    }

    pub fn put_by_value(&mut self, base: Value, key: Value, value: Value) -> Result<(), Value> {
        if base.is_nullish() {
            return Err(self.throw_string(messages::NULLISH_PROPERTY_WRITE));
        }
        if base.is_object() {
            if let Some(index) = Self::element_index(key) {
                let object = self.script_object_mut(base.as_obj_id());
                if index >= object.elements.len() {
                    object.elements.resize(index + 1, Value::UNDEFINED);
                }
                object.elements[index] = value;
                return Ok(());
            }
        }
        let name = self.to_property_key(key)?;
        self.put_property(base, &name, value)
    }

    pub fn delete_by_value(&mut self, base: Value, key: Value) -> Result<bool, Value> {
        if base.is_object() {
            if let Some(index) = Self::element_index(key) {
                let object = self.script_object_mut(base.as_obj_id());
                if index < object.elements.len() {
                    object.elements[index] = Value::UNDEFINED;
                }
                return Ok(true);
            }
        }
        let name = self.to_property_key(key)?;
        self.delete_property(base, &name)
    }

    // ---- protocol helpers --------------------------------------------------

    pub fn has_property(&mut self, base: Value, key: Value) -> Result<bool, Value> {
        if !base.is_object() && !base.is_function() {
            return Err(self.throw_string(messages::NOT_AN_OBJECT));
        }
        if base.is_function() {
            let name = self.to_property_key(key)?;
            return Ok(self.function_object(base.as_obj_id()).properties.contains_key(&name));
        }
        if let Some(index) = Self::element_index(key) {
            let object = self.script_object(base.as_obj_id());
            if index < object.elements.len() {
                return Ok(true);
            }
        }
        let name = self.to_property_key(key)?;
        let mut current = base;
        while current.is_object() {
            let object = self.script_object(current.as_obj_id());
            if self.shape_lookup(object.shape, &name).is_some() {
                return Ok(true);
            }
            current = self.script_object(current.as_obj_id()).prototype;
        }
        Ok(false)
    }

    pub fn instance_of(&mut self, value: Value, target: Value) -> Result<bool, Value> {
        if !target.is_function() {
            return Err(self.throw_string(messages::NOT_A_FUNCTION));
        }
        let prototype = self
            .function_object(target.as_obj_id())
            .properties
            .get("prototype")
            .copied()
            .unwrap_or(Value::UNDEFINED);
        if !value.is_object() {
            return Ok(false);
        }
        let mut current = self.script_object(value.as_obj_id()).prototype;
        while current.is_object() {
            if current == prototype {
                return Ok(true);
            }
            current = self.script_object(current.as_obj_id()).prototype;
        }
        Ok(false)
    }

    /// Own enumerable keys of one object: element indices first, then named
    /// properties in shape (insertion) order.
    pub(crate) fn own_enumerable_keys(&self, base: Value) -> Vec<String> {
        let mut keys = Vec::new();
        if !base.is_object() {
            return keys;
        }
        let object = self.script_object(base.as_obj_id());
        let mut buffer = itoa::Buffer::new();
        for index in 0..object.elements.len() {
            if !object.elements[index].is_undefined() {
                keys.push(buffer.format(index).to_string());
            }
        }
        let mut named: Vec<(String, u32)> = self
            .shape(object.shape)
            .prop_map
            .iter()
            .map(|(key, offset)| (key.clone(), *offset))
            .collect();
        named.sort_by_key(|(_, offset)| *offset);
        for (key, offset) in named {
            // Private names and accessors do not enumerate.
            if key.starts_with('#') {
                continue;
            }
            if object.prop_values[offset as usize].is_accessor() {
                continue;
            }
            keys.push(key);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_built_the_same_way_share_shapes() {
        let mut rt = Runtime::new();
        let a = rt.new_object();
        let b = rt.new_object();
        rt.put_property(a, "x", Value::from_i64(1)).unwrap();
        rt.put_property(a, "y", Value::from_i64(2)).unwrap();
        rt.put_property(b, "x", Value::from_i64(3)).unwrap();
        rt.put_property(b, "y", Value::from_i64(4)).unwrap();
        let shape_a = rt.script_object(a.as_obj_id()).shape;
        let shape_b = rt.script_object(b.as_obj_id()).shape;
        assert_eq!(shape_a, shape_b, "transition tree must share layouts");
        assert_eq!(rt.get_property(a, "y").unwrap(), Value::from_i64(2));
        assert_eq!(rt.get_property(b, "x").unwrap(), Value::from_i64(3));
    }

    #[test]
    fn prototype_chain_reads_do_not_cache() {
        let mut rt = Runtime::new();
        let proto = rt.new_object();
        rt.put_property(proto, "shared", Value::from_i64(7)).unwrap();
        let object = rt.new_object_with_prototype(proto);
        let (value, slot) = rt.get_property_cached(object, "shared").unwrap();
        assert_eq!(value, Value::from_i64(7));
        assert!(slot.is_none(), "prototype hits are not own-slot cacheable");
    }

    #[test]
    fn delete_bumps_the_shape_generation() {
        let mut rt = Runtime::new();
        let object = rt.new_object();
        rt.put_property(object, "x", Value::from_i64(1)).unwrap();
        rt.put_property(object, "y", Value::from_i64(2)).unwrap();
        let before = rt.shape_generation;
        assert!(rt.delete_property(object, "x").unwrap());
        assert!(rt.shape_generation > before);
        assert_eq!(rt.get_property(object, "x").unwrap(), Value::UNDEFINED);
        assert_eq!(rt.get_property(object, "y").unwrap(), Value::from_i64(2));
    }

    #[test]
    fn element_writes_grow_the_vector() {
        let mut rt = Runtime::new();
        let array = rt.new_array(Vec::new());
        rt.put_by_value(array, Value::from_i64(2), Value::from_i64(9)).unwrap();
        assert_eq!(rt.get_property(array, "length").unwrap(), Value::from_i64(3));
        assert_eq!(rt.get_by_value(array, Value::from_i64(2)).unwrap(), Value::from_i64(9));
        assert_eq!(rt.get_by_value(array, Value::from_i64(0)).unwrap(), Value::UNDEFINED);
    }

    #[test]
    fn cached_slot_reads_validate_shape_identity() {
        let mut rt = Runtime::new();
        let a = rt.new_object();
        rt.put_property(a, "x", Value::from_i64(1)).unwrap();
        let (_, slot) = rt.get_property_cached(a, "x").unwrap();
        let slot = slot.expect("own data property is cacheable");
        assert_eq!(rt.read_property_slot(a, slot), Some(Value::from_i64(1)));

        // A different layout must miss.
        let b = rt.new_object();
        rt.put_property(b, "y", Value::from_i64(2)).unwrap();
        assert_eq!(rt.read_property_slot(b, slot), None);
    }
}
