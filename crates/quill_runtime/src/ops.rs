//! Abstract operations: coercions, arithmetic, comparisons, equality.
//!
//! The interpreter's fast paths handle inline integers before landing here;
//! these are the general result-or-exception services the dispatch loop
//! consumes.

use quill_ir::to_int32;

use crate::heap::ManagedObject;
use crate::runtime::Runtime;
use crate::value::Value;

/// Shortest-roundtrip number formatting: integral values print without a
/// fraction, everything else through ryu.
pub fn number_to_string(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value.trunc() == value && value.abs() < 9007199254740992.0 {
        let mut buffer = itoa::Buffer::new();
        return buffer.format(value as i64).to_string();
    }
    let mut buffer = ryu::Buffer::new();
    buffer.format(value).to_string()
}

impl Runtime {
    pub fn to_boolean(&self, value: Value) -> bool {
        if value.is_f64() {
            let f = value.as_f64();
            return f != 0.0 && !f.is_nan();
        }
        if value.is_int() {
            return value.as_i64() != 0;
        }
        if value.is_bool() {
            return value.as_bool();
        }
        if value.is_nullish() || value.is_empty() {
            return false;
        }
        if value.is_string() {
            return !self.string_content(value).is_empty();
        }
        true
    }

    pub fn to_number(&mut self, value: Value) -> Result<f64, Value> {
        if value.is_number() {
            return Ok(value.as_number());
        }
        if value.is_bool() {
            return Ok(if value.as_bool() { 1.0 } else { 0.0 });
        }
        if value.is_null() {
            return Ok(0.0);
        }
        if value.is_undefined() {
            return Ok(f64::NAN);
        }
        if value.is_string() {
            let text = self.string_content(value).trim().to_string();
            if text.is_empty() {
                return Ok(0.0);
            }
            return Ok(match text.as_str() {
                "Infinity" | "+Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                _ => text.parse::<f64>().unwrap_or(f64::NAN),
            });
        }
        // Objects and the rest coerce to NaN at this seam.
        Ok(f64::NAN)
    }

    pub fn to_string_value(&mut self, value: Value) -> Result<String, Value> {
        if value.is_f64() || value.is_int() {
            return Ok(number_to_string(value.as_number()));
        }
        if value.is_bool() {
            return Ok(if value.as_bool() { "true" } else { "false" }.to_string());
        }
        if value.is_undefined() {
            return Ok("undefined".to_string());
        }
        if value.is_null() {
            return Ok("null".to_string());
        }
        if value.is_string() {
            return Ok(self.string_content(value).to_string());
        }
        if value.is_function() {
            let name = self.function_object(value.as_obj_id()).name.clone();
            return Ok(format!("function {name}() {{ [bytecode] }}"));
        }
        if value.is_object() {
            let object = self.script_object(value.as_obj_id());
            if object.is_array {
                let elements = object.elements.clone();
                let mut parts = Vec::with_capacity(elements.len());
                for element in elements {
                    if element.is_nullish() {
                        parts.push(String::new());
                    } else {
                        parts.push(self.to_string_value(element)?);
                    }
                }
                return Ok(parts.join(","));
            }
            return Ok("[object Object]".to_string());
        }
        Ok("[object Object]".to_string())
    }

    pub fn to_property_key(&mut self, key: Value) -> Result<String, Value> {
        self.to_string_value(key)
    }

    // ---- arithmetic ------------------------------------------------------

    pub fn add_values(&mut self, a: Value, b: Value) -> Result<Value, Value> {
        if a.is_int() && b.is_int() {
            return Ok(Value::number((a.as_i64() + b.as_i64()) as f64));
        }
        if a.is_number() && b.is_number() {
            return Ok(Value::number(a.as_number() + b.as_number()));
        }
        if a.is_string() || b.is_string() || a.is_object() || b.is_object() || a.is_function() || b.is_function() {
            let left = self.to_string_value(a)?;
            let right = self.to_string_value(b)?;
            let mut result = String::with_capacity(left.len() + right.len());
            result.push_str(&left);
            result.push_str(&right);
            return Ok(self.alloc_string(result));
        }
        let left = self.to_number(a)?;
        let right = self.to_number(b)?;
        Ok(Value::number(left + right))
    }

    pub fn sub_values(&mut self, a: Value, b: Value) -> Result<Value, Value> {
        if a.is_int() && b.is_int() {
            return Ok(Value::number((a.as_i64() - b.as_i64()) as f64));
        }
        let left = self.to_number(a)?;
        let right = self.to_number(b)?;
        Ok(Value::number(left - right))
    }

    pub fn mul_values(&mut self, a: Value, b: Value) -> Result<Value, Value> {
        let left = self.to_number(a)?;
        let right = self.to_number(b)?;
        Ok(Value::number(left * right))
    }

    pub fn div_values(&mut self, a: Value, b: Value) -> Result<Value, Value> {
        let left = self.to_number(a)?;
        let right = self.to_number(b)?;
        Ok(Value::number(left / right))
    }

    pub fn mod_values(&mut self, a: Value, b: Value) -> Result<Value, Value> {
        let left = self.to_number(a)?;
        let right = self.to_number(b)?;
        Ok(Value::number(left % right))
    }

    /// Shared path for the int32 bitwise family.
    pub fn int32_op(
        &mut self,
        a: Value,
        b: Value,
        op: impl FnOnce(i32, i32) -> i32,
    ) -> Result<Value, Value> {
        let left = to_int32(self.to_number(a)?);
        let right = to_int32(self.to_number(b)?);
        Ok(Value::number(op(left, right) as f64))
    }

    // ---- comparisons -----------------------------------------------------

    fn compare(&mut self, a: Value, b: Value) -> Result<Option<std::cmp::Ordering>, Value> {
        if a.is_string() && b.is_string() {
            let left = self.string_content(a);
            let right = self.string_content(b);
            return Ok(Some(left.cmp(right)));
        }
        let left = self.to_number(a)?;
        let right = self.to_number(b)?;
        Ok(left.partial_cmp(&right))
    }

    pub fn less_than(&mut self, a: Value, b: Value) -> Result<bool, Value> {
        Ok(matches!(self.compare(a, b)?, Some(std::cmp::Ordering::Less)))
    }

    pub fn less_than_equals(&mut self, a: Value, b: Value) -> Result<bool, Value> {
        Ok(matches!(
            self.compare(a, b)?,
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ))
    }

    pub fn greater_than(&mut self, a: Value, b: Value) -> Result<bool, Value> {
        Ok(matches!(self.compare(a, b)?, Some(std::cmp::Ordering::Greater)))
    }

    pub fn greater_than_equals(&mut self, a: Value, b: Value) -> Result<bool, Value> {
        Ok(matches!(
            self.compare(a, b)?,
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ))
    }

    // ---- equality --------------------------------------------------------

    pub fn strict_equals(&self, a: Value, b: Value) -> bool {
        if a.is_number() || b.is_number() {
            if !(a.is_number() && b.is_number()) {
                return false;
            }
            // Numeric comparison: NaN is unequal to itself, zeroes agree.
            return a.as_number() == b.as_number();
        }
        if a.is_string() && b.is_string() {
            if a.as_obj_id() == b.as_obj_id() {
                return true;
            }
            return self.string_content(a) == self.string_content(b);
        }
        a == b
    }

    pub fn loose_equals(&mut self, a: Value, b: Value) -> Result<bool, Value> {
        if a.is_nullish() && b.is_nullish() {
            return Ok(true);
        }
        if a.is_nullish() || b.is_nullish() {
            return Ok(false);
        }
        if (a.is_number() && b.is_number())
            || (a.is_string() && b.is_string())
            || (a.is_bool() && b.is_bool())
        {
            return Ok(self.strict_equals(a, b));
        }
        if a.is_bool() {
            let left = Value::number(if a.as_bool() { 1.0 } else { 0.0 });
            return self.loose_equals(left, b);
        }
        if b.is_bool() {
            let right = Value::number(if b.as_bool() { 1.0 } else { 0.0 });
            return self.loose_equals(a, right);
        }
        if a.is_number() && b.is_string() {
            let right = self.to_number(b)?;
            return Ok(a.as_number() == right);
        }
        if a.is_string() && b.is_number() {
            let left = self.to_number(a)?;
            return Ok(left == b.as_number());
        }
        if (a.is_object() || a.is_function()) && (b.is_number() || b.is_string()) {
            let primitive = self.to_string_value(a)?;
            let primitive = self.alloc_string(primitive);
            return self.loose_equals(primitive, b);
        }
        if (b.is_object() || b.is_function()) && (a.is_number() || a.is_string()) {
            let primitive = self.to_string_value(b)?;
            let primitive = self.alloc_string(primitive);
            return self.loose_equals(a, primitive);
        }
        // Remaining combinations compare by identity.
        Ok(a == b)
    }

    pub fn typeof_string(&mut self, value: Value) -> Value {
        let name = value.type_name();
        self.alloc_string(name)
    }

    pub(crate) fn completion_cell(&mut self, kind: i32, value: Value) -> Value {
        Value::completion(self.heap.alloc(ManagedObject::Completion { kind, value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_formatting_matches_source_language() {
        assert_eq!(number_to_string(5.0), "5");
        assert_eq!(number_to_string(-0.5), "-0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
    }

    #[test]
    fn add_concatenates_when_either_side_is_a_string() {
        let mut rt = Runtime::new();
        let s = rt.alloc_string("x");
        let result = rt.add_values(s, Value::from_i64(1)).unwrap();
        assert_eq!(rt.string_content(result), "x1");
        let result = rt.add_values(Value::from_i64(2), Value::from_i64(3)).unwrap();
        assert_eq!(result, Value::from_i64(5));
    }

    #[test]
    fn strict_equality_is_numeric_for_numbers() {
        let rt = Runtime::new();
        assert!(rt.strict_equals(Value::from_i64(1), Value::from_f64(1.0)));
        assert!(!rt.strict_equals(Value::from_f64(f64::NAN), Value::from_f64(f64::NAN)));
        assert!(rt.strict_equals(Value::from_f64(0.0), Value::from_f64(-0.0)));
        assert!(!rt.strict_equals(Value::from_i64(1), Value::TRUE));
    }

    #[test]
    fn loose_equality_coerces_numbers_and_strings() {
        let mut rt = Runtime::new();
        let s = rt.alloc_string("5");
        assert!(rt.loose_equals(Value::from_i64(5), s).unwrap());
        assert!(rt.loose_equals(Value::NULL, Value::UNDEFINED).unwrap());
        assert!(!rt.loose_equals(Value::NULL, Value::from_i64(0)).unwrap());
    }

    #[test]
    fn to_number_parses_trimmed_strings() {
        let mut rt = Runtime::new();
        let s = rt.alloc_string("  12.5 ");
        assert_eq!(rt.to_number(s).unwrap(), 12.5);
        let s = rt.alloc_string("");
        assert_eq!(rt.to_number(s).unwrap(), 0.0);
        let s = rt.alloc_string("nope");
        assert!(rt.to_number(s).unwrap().is_nan());
    }
}
