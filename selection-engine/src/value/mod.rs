//! Dynamic values flowing through compiled operations.
//!
//! Root contexts, provider results, resolver outputs and the final response data are all
//! [`Value`]s. Records replace statically declared result types: a projection builds a
//! [`Record`] at runtime through [`RecordBuilder`].

mod pending;
mod record;

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use serde::Serializer;
use serde::ser::Error as _;
use serde::ser::SerializeSeq;
use serde_json::Number;
use serde_json_bytes::ByteString;

pub use self::pending::Pending;
pub use self::pending::PendingStream;
pub use self::record::Member;
pub use self::record::Origin;
pub use self::record::Record;
pub use self::record::RecordBuilder;
pub use self::record::Shape;
use crate::json_ext::JsonValue;

/// The runtime kind of a value, recorded in record shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Null,
    Boolean,
    Number,
    String,
    List,
    Record,
    Pending,
    Stream,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Null => "null",
            TypeTag::Boolean => "boolean",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::List => "list",
            TypeTag::Record => "record",
            TypeTag::Pending => "pending value",
            TypeTag::Stream => "stream",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(ByteString),
    List(Vec<Value>),
    Record(Record),
    Pending(Pending),
    Stream(PendingStream),
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Boolean,
            Value::Number(_) => TypeTag::Number,
            Value::String(_) => TypeTag::String,
            Value::List(_) => TypeTag::List,
            Value::Record(_) => TypeTag::Record,
            Value::Pending(_) => TypeTag::Pending,
            Value::Stream(_) => TypeTag::Stream,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Reads a member of a record value. Anything that is not a record has no members.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_record().and_then(|record| record.get(name))
    }

    /// Returns `true` if neither this value nor anything nested in it is pending.
    pub fn is_resolved(&self) -> bool {
        match self {
            Value::Pending(_) | Value::Stream(_) => false,
            Value::List(items) => items.iter().all(Value::is_resolved),
            Value::Record(record) => record.iter().all(|(_, value)| value.is_resolved()),
            _ => true,
        }
    }

    /// A string identifying this value for deduplication, `None` for null.
    ///
    /// Strings keep their quotes so that `"1"` and `1` stay distinct keys.
    pub(crate) fn key_string(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => serde_json::to_string(other).ok(),
        }
    }

    /// Orders two values the way filters and sorts compare them. Null sorts first.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality where `1` and `1.0` are the same number.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            _ => self == other,
        }
    }

    /// Converts a fully resolved value to plain JSON.
    pub fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json_bytes::to_value(self)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Pending(a), Value::Pending(b)) => a.ptr_eq(b),
            (Value::Stream(a), Value::Stream(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s.as_str()),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Record(record) => record.serialize(serializer),
            Value::Pending(_) | Value::Stream(_) => Err(S::Error::custom(
                "cannot serialize a value that has not been resolved",
            )),
        }
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(mut object) => {
                let type_name = match object.remove("__typename") {
                    Some(JsonValue::String(name)) => Some(name),
                    _ => None,
                };
                let mut builder = RecordBuilder::external().maybe_type_name(type_name);
                for (key, value) in object {
                    builder.push(key.as_str(), None, Value::from(value));
                }
                Value::Record(builder.build())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(ByteString::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(ByteString::from(s))
    }
}

impl From<ByteString> for Value {
    fn from(s: ByteString) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Record(record)
    }
}

impl From<Pending> for Value {
    fn from(pending: Pending) -> Self {
        Value::Pending(pending)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
