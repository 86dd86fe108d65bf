use super::error::BencodeError;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value.
///
/// Besides the plain `as_*` accessors, dictionaries expose `require_*` and
/// `optional_*` lookups that distinguish an absent key
/// ([`BencodeError::MissingKey`]) from a present key of the wrong type
/// ([`BencodeError::WrongType`]).
///
/// # Examples
///
/// ```
/// use rbit_dht::bencode::{decode, Value};
///
/// let value = decode(b"d2:id3:abc4:porti80ee").unwrap();
/// assert_eq!(value.require_int(b"port").unwrap(), 80);
/// assert!(value.require_int(b"id").is_err());
/// assert!(value.optional_bytes(b"token").unwrap().is_none());
///
/// let built = Value::dict([("port", Value::Integer(80))]);
/// assert_eq!(built.get(b"port"), Some(&Value::Integer(80)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string (may or may not be valid UTF-8).
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys (sorted by key in bencode encoding).
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a byte string value by copying a slice.
    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    /// Builds a dictionary from static keys.
    pub fn dict<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Bytes::from_static(k.as_bytes()), v))
                .collect(),
        )
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns `None` if the value is not a byte string or is not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key in this value if it is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Looks up a key that must be present.
    ///
    /// Fails with [`BencodeError::WrongType`] if `self` is not a dictionary.
    pub fn require(&self, key: &[u8]) -> Result<&Value, BencodeError> {
        let dict = self
            .as_dict()
            .ok_or_else(|| BencodeError::wrong_type(key, "dict container", self.type_name()))?;
        dict.get(key).ok_or_else(|| BencodeError::missing(key))
    }

    pub fn require_bytes(&self, key: &[u8]) -> Result<&Bytes, BencodeError> {
        Self::expect(key, self.require(key)?, Value::as_bytes, "bytes")
    }

    pub fn require_str(&self, key: &[u8]) -> Result<&str, BencodeError> {
        Self::expect(key, self.require(key)?, Value::as_str, "utf-8 string")
    }

    pub fn require_int(&self, key: &[u8]) -> Result<i64, BencodeError> {
        Self::expect(key, self.require(key)?, Value::as_integer, "integer")
    }

    pub fn require_list(&self, key: &[u8]) -> Result<&[Value], BencodeError> {
        Self::expect(key, self.require(key)?, Value::as_list, "list")
    }

    /// Returns the nested dictionary stored under `key`.
    pub fn require_dict(&self, key: &[u8]) -> Result<&Value, BencodeError> {
        let value = self.require(key)?;
        match value {
            Value::Dict(_) => Ok(value),
            other => Err(BencodeError::wrong_type(key, "dict", other.type_name())),
        }
    }

    /// `Ok(None)` if the key is absent, an error if it has the wrong type.
    pub fn optional_bytes(&self, key: &[u8]) -> Result<Option<&Bytes>, BencodeError> {
        self.optional(key, Value::as_bytes, "bytes")
    }

    pub fn optional_int(&self, key: &[u8]) -> Result<Option<i64>, BencodeError> {
        self.optional(key, Value::as_integer, "integer")
    }

    pub fn optional_list(&self, key: &[u8]) -> Result<Option<&[Value]>, BencodeError> {
        self.optional(key, Value::as_list, "list")
    }

    fn optional<'a, T>(
        &'a self,
        key: &[u8],
        access: impl Fn(&'a Value) -> Option<T>,
        expected: &'static str,
    ) -> Result<Option<T>, BencodeError> {
        match self.require(key) {
            Ok(value) => Self::expect(key, value, access, expected).map(Some),
            Err(e) if e.is_missing() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn expect<'a, T>(
        key: &[u8],
        value: &'a Value,
        access: impl Fn(&'a Value) -> Option<T>,
        expected: &'static str,
    ) -> Result<T, BencodeError> {
        access(value).ok_or_else(|| BencodeError::wrong_type(key, expected, value.type_name()))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}
