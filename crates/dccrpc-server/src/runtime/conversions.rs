//! `serde_json::Value` <-> Boa `JsValue`.
//!
//! | JSON | JavaScript |
//! |------|------------|
//! | null | null (undefined maps back to null) |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object (symbol keys are skipped) |
//!
//! Whole numbers that fit in 2^53 come back as JSON integers.

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use dccrpc_common::protocol::error::{Result, RpcError};
use serde_json::{Map, Value};

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

pub fn json_to_js_value(json: &Value, ctx: &mut Context) -> Result<JsValue> {
    match json {
        Value::Null => Ok(JsValue::null()),
        Value::Bool(b) => Ok(JsValue::new(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                return Ok(JsValue::new(i));
            }
            n.as_f64()
                .map(JsValue::new)
                .ok_or_else(|| RpcError::Script(format!("Number {} is out of range", n)))
        }
        Value::String(s) => Ok(JsValue::new(js_string!(s.clone()))),
        Value::Array(items) => {
            let array = JsArray::new(ctx);
            for (i, item) in items.iter().enumerate() {
                let value = json_to_js_value(item, ctx)?;
                array
                    .push(value, ctx)
                    .map_err(|e| RpcError::Script(format!("Failed to push array element {}: {}", i, e)))?;
            }
            Ok(array.into())
        }
        Value::Object(map) => Ok(json_object_to_js(map, ctx)?.into()),
    }
}

pub fn json_object_to_js(map: &Map<String, Value>, ctx: &mut Context) -> Result<JsObject> {
    let object = JsObject::with_object_proto(ctx.intrinsics());
    for (key, value) in map {
        let value = json_to_js_value(value, ctx)?;
        object
            .create_data_property_or_throw(js_string!(key.clone()), value, ctx)
            .map_err(|e| RpcError::Script(format!("Failed to set property '{}': {}", key, e)))?;
    }
    Ok(object)
}

pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<Value> {
    if value.is_undefined() || value.is_null() || value.is_symbol() {
        return Ok(Value::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(Value::Bool(b));
    }

    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
            return Ok(Value::Number((n as i64).into()));
        }
        return serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| RpcError::Script(format!("{} cannot be represented in JSON", n)));
    }

    if let Some(s) = value.as_string() {
        return s
            .to_std_string()
            .map(Value::String)
            .map_err(|e| RpcError::Script(format!("Invalid string: {:?}", e)));
    }

    let Some(object) = value.as_object() else {
        return Ok(Value::Null);
    };

    if object.is_array() {
        let array = JsArray::from_object(object.clone())
            .map_err(|e| RpcError::Script(format!("Invalid array: {}", e)))?;
        let length = array
            .length(ctx)
            .map_err(|e| RpcError::Script(format!("Failed to read array length: {}", e)))?;
        let length = usize::try_from(length).map_err(|_| RpcError::Script("Array length overflow".into()))?;

        let mut items = Vec::with_capacity(length.min(4096));
        for i in 0..length {
            let item = array
                .get(i, ctx)
                .map_err(|e| RpcError::Script(format!("Failed to read array element {}: {}", i, e)))?;
            items.push(js_value_to_json(&item, ctx)?);
        }
        return Ok(Value::Array(items));
    }

    if object.is_callable() {
        return Ok(Value::Null);
    }

    let keys = object
        .own_property_keys(ctx)
        .map_err(|e| RpcError::Script(format!("Failed to read object keys: {}", e)))?;

    let mut map = Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s
                .to_std_string()
                .map_err(|e| RpcError::Script(format!("Invalid property name: {:?}", e)))?,
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let property = object
            .get(key, ctx)
            .map_err(|e| RpcError::Script(format!("Failed to read property '{}': {}", name, e)))?;
        map.insert(name, js_value_to_json(&property, ctx)?);
    }
    Ok(Value::Object(map))
}
