//! AMF value types
//!
//! Objects keep their key order: encoders such as OBS and FFmpeg emit
//! metadata in a meaningful order and we forward it as received.

/// Ordered key-value properties of an AMF object or ECMA array
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmfObject(Vec<(String, AmfValue)>);

impl AmfObject {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Look up a property by key (first match)
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set a property, replacing an existing value in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AmfValue>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Remove a property, returning its value
    pub fn remove(&mut self, key: &str) -> Option<AmfValue> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AmfValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AmfValue>) -> Self {
        self.insert(key, value);
        self
    }

    // Decoders keep duplicate keys as sent
    pub(crate) fn push_raw(&mut self, key: String, value: AmfValue) {
        self.0.push((key, value));
    }
}

impl<K: Into<String>, V: Into<AmfValue>> FromIterator<(K, V)> for AmfObject {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut obj = AmfObject::new();
        for (k, v) in iter {
            obj.insert(k, v);
        }
        obj
    }
}

impl IntoIterator for AmfObject {
    type Item = (String, AmfValue);
    type IntoIter = std::vec::IntoIter<(String, AmfValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// AMF0 value
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AmfValue {
    /// IEEE 754 double (0x00)
    Number(f64),

    /// Boolean (0x01)
    Boolean(bool),

    /// UTF-8 string (0x02, or 0x0C when longer than 65535 bytes)
    String(String),

    /// Anonymous object (0x03)
    Object(AmfObject),

    /// Null (0x05)
    #[default]
    Null,

    /// Undefined (0x06)
    Undefined,

    /// Associative array (0x08)
    EcmaArray(AmfObject),

    /// Dense array (0x0A)
    StrictArray(Vec<AmfValue>),

    /// Milliseconds since the Unix epoch plus a legacy timezone (0x0B)
    Date { millis: f64, timezone: i16 },

    /// XML document (0x0F)
    Xml(String),

    /// Object with a class name (0x10)
    TypedObject {
        class_name: String,
        properties: AmfObject,
    },
}

impl AmfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Properties of an object, ECMA array or typed object
    pub fn as_object(&self) -> Option<&AmfObject> {
        match self {
            AmfValue::Object(m) => Some(m),
            AmfValue::EcmaArray(m) => Some(m),
            AmfValue::TypedObject { properties, .. } => Some(properties),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AmfValue]> {
        match self {
            AmfValue::StrictArray(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Get a property from an object-like value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(f64::from(v))
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<AmfObject> for AmfValue {
    fn from(v: AmfObject) -> Self {
        AmfValue::Object(v)
    }
}
