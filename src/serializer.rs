use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// Hook invoked for every [`OpaqueValue`] found while serializing.
///
/// The hook returns a JSON-representable substitute for the wrapped value,
/// or `None` if it does not know how to convert it. In the latter case
/// serialization fails with [`SerializeError::Unsupported`].
pub type FallbackFn = Arc<dyn Fn(&OpaqueValue) -> Option<Value> + Send + Sync>;

/// Error produced while turning a record into its JSON line.
#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("value of type `{0}` is not JSON-serializable")]
    Unsupported(&'static str),

    #[error("json encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A value that is not natively JSON-representable.
///
/// The wrapped value is type-erased; the type name is captured at
/// construction time so failures can report what could not be encoded.
#[derive(Clone)]
pub struct OpaqueValue {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl OpaqueValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        OpaqueValue {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    /// Type name of the wrapped value, as captured at construction.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Attempt to view the wrapped value as `T`. This is what fallback
    /// hooks use to recognize the types they can convert.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// One node of the value tree handed to [`dumps`].
///
/// `Object` keeps its insertion order; the formatter relies on this to emit
/// the schema fields in a stable order.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Natively representable JSON value.
    Json(Value),
    /// Ordered mapping; keys are unique by construction.
    Object(Vec<(String, FieldValue)>),
    Array(Vec<FieldValue>),
    /// Needs the fallback hook to become JSON.
    Opaque(OpaqueValue),
}

impl FieldValue {
    /// Wrap an arbitrary value for later conversion through the fallback.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        FieldValue::Opaque(OpaqueValue::new(value))
    }

    /// Convert any `Serialize` type into a native node.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, SerializeError> {
        Ok(FieldValue::Json(serde_json::to_value(value)?))
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Json(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Json(Value::from(v))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Json(Value::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Json(Value::from(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Json(Value::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Json(Value::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Json(Value::from(v))
    }
}

/// Rendering used when a value is substituted into a message template.
/// Strings render bare, everything else as compact JSON; opaque values
/// render as their type name since no fallback is available at this point.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Json(Value::String(s)) => f.write_str(s),
            FieldValue::Json(v) => write!(f, "{}", v),
            FieldValue::Object(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{:?}:{}", k, v)?;
                }
                f.write_str("}")
            }
            FieldValue::Array(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            FieldValue::Opaque(o) => write!(f, "<{}>", o.type_name()),
        }
    }
}

/// Serialize a value tree into a compact, single-line JSON string.
///
/// No whitespace is inserted between tokens and non-ASCII characters are
/// emitted literally rather than escaped to `\uXXXX`. Opaque nodes are
/// resolved through `fallback`; without one (or when it declines) the call
/// fails identifying the offending value's type.
pub fn dumps(value: &FieldValue, fallback: Option<&FallbackFn>) -> Result<String, SerializeError> {
    let resolved = resolve(value, fallback)?;
    Ok(serde_json::to_string(&resolved)?)
}

fn resolve(value: &FieldValue, fallback: Option<&FallbackFn>) -> Result<Value, SerializeError> {
    match value {
        FieldValue::Json(v) => Ok(v.clone()),
        FieldValue::Object(pairs) => {
            let mut map = serde_json::Map::with_capacity(pairs.len());
            for (key, val) in pairs {
                map.insert(key.clone(), resolve(val, fallback)?);
            }
            Ok(Value::Object(map))
        }
        FieldValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve(item, fallback)?);
            }
            Ok(Value::Array(out))
        }
        FieldValue::Opaque(opaque) => match fallback {
            Some(hook) => hook(opaque).ok_or(SerializeError::Unsupported(opaque.type_name())),
            None => Err(SerializeError::Unsupported(opaque.type_name())),
        },
    }
}
