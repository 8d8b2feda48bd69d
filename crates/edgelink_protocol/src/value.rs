//! Helpers for building and reading CBOR value trees.

use crate::error::{ProtocolError, ProtocolResult};
use ciborium::value::Value;

pub(crate) fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

pub(crate) fn uint(n: u64) -> Value {
    Value::Integer(n.into())
}

pub(crate) fn opt_text(s: Option<&str>) -> Value {
    s.map_or(Value::Null, text)
}

/// Builds a map with text keys, preserving the given order.
pub(crate) fn map(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(pairs.into_iter().map(|(k, v)| (text(k), v)).collect())
}

pub(crate) fn to_bytes(value: &Value) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn from_bytes(bytes: &[u8]) -> ProtocolResult<Value> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

/// Read-only view over the text-keyed entries of a CBOR map.
pub(crate) struct Fields<'a> {
    entries: &'a [(Value, Value)],
    context: &'static str,
}

impl<'a> Fields<'a> {
    pub(crate) fn of(value: &'a Value, context: &'static str) -> ProtocolResult<Self> {
        let entries = value
            .as_map()
            .map(Vec::as_slice)
            .ok_or_else(|| ProtocolError::invalid_structure(format!("{context}: expected map")))?;
        Ok(Self { entries, context })
    }

    pub(crate) fn get(&self, name: &str) -> Option<&'a Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_text() == Some(name))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
    }

    fn missing(&self, name: &str) -> ProtocolError {
        ProtocolError::invalid_structure(format!("{}: missing or invalid {name}", self.context))
    }

    pub(crate) fn require(&self, name: &str) -> ProtocolResult<&'a Value> {
        self.get(name).ok_or_else(|| self.missing(name))
    }

    pub(crate) fn text(&self, name: &str) -> ProtocolResult<&'a str> {
        self.get(name)
            .and_then(Value::as_text)
            .ok_or_else(|| self.missing(name))
    }

    pub(crate) fn opt_text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(Value::as_text).map(str::to_owned)
    }

    pub(crate) fn uint(&self, name: &str) -> ProtocolResult<u64> {
        self.opt_uint(name).ok_or_else(|| self.missing(name))
    }

    pub(crate) fn opt_uint(&self, name: &str) -> Option<u64> {
        self.get(name)
            .and_then(Value::as_integer)
            .and_then(|i| u64::try_from(i).ok())
    }

    pub(crate) fn bool(&self, name: &str) -> ProtocolResult<bool> {
        self.get(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| self.missing(name))
    }

    pub(crate) fn bytes(&self, name: &str) -> ProtocolResult<&'a [u8]> {
        self.get(name)
            .and_then(Value::as_bytes)
            .map(Vec::as_slice)
            .ok_or_else(|| self.missing(name))
    }

    pub(crate) fn array(&self, name: &str) -> ProtocolResult<&'a [Value]> {
        self.get(name)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| self.missing(name))
    }
}
