//! Message payloads and scoped properties.
//!
//! A [`Message`] is the data carried by an [`Event`](crate::event::Event): a
//! [`Payload`] plus a set of [`Properties`] partitioned by [`PropertyScope`].
//!
//! Properties are an immutable map-of-maps. Every write goes through a
//! `with_*` builder that returns a new value, so a message that has been
//! handed to another branch can never be changed underneath it.
//!
//! # Example
//!
//! ```
//! use correlator_core::message::{Message, PropertyScope};
//!
//! let message = Message::text("order-42")
//!     .with_property(PropertyScope::Outbound, "priority", 3_i64)
//!     .with_property(PropertyScope::Invocation, "retried", false);
//!
//! assert_eq!(message.as_string(), "order-42");
//! assert_eq!(message.properties().get_i64(PropertyScope::Outbound, "priority"), Some(3));
//! assert_eq!(message.properties().get_bool(PropertyScope::Invocation, "retried"), Some(false));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The payload of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Payload {
    /// No payload
    #[default]
    Null,
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Structured JSON document
    Json(#[serde(with = "json_text")] serde_json::Value),
    /// Ordered collection of messages, produced by aggregation
    Collection(Vec<Message>),
}

impl Payload {
    /// Render the payload as a string.
    ///
    /// Bytes are decoded lossily, JSON is serialized and collections are
    /// rendered as `[a,b,c]`.
    #[must_use]
    pub fn as_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Text(text) => text.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Json(value) => value.to_string(),
            Self::Collection(messages) => {
                let parts: Vec<String> = messages.iter().map(Message::as_string).collect();
                format!("[{}]", parts.join(","))
            },
        }
    }

    /// Number of messages in a collection payload, `None` for other payloads.
    #[must_use]
    pub fn collection_len(&self) -> Option<usize> {
        match self {
            Self::Collection(messages) => Some(messages.len()),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Scope a property lives in.
///
/// Scopes replace the string-keyed, runtime-coerced property bags of classic
/// ESB runtimes with an explicit, typed partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyScope {
    /// Set by the source that received the message (read-only for flows)
    Inbound,
    /// Sent along with the message to the next endpoint
    Outbound,
    /// Lives only for the current invocation
    Invocation,
    /// Survives across request and reply within a session
    Session,
}

impl fmt::Display for PropertyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
            Self::Invocation => write!(f, "invocation"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Text value
    Text(String),
    /// Integer value
    Integer(i64),
    /// Boolean value
    Boolean(bool),
    /// Arbitrary JSON value
    Json(#[serde(with = "json_text")] serde_json::Value),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// JSON values travel as their text form so that non-self-describing formats
/// such as bincode can round-trip them.
mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &serde_json::Value, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(d)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Scoped, immutable property map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Properties {
    scopes: BTreeMap<PropertyScope, BTreeMap<String, PropertyValue>>,
}

impl Properties {
    /// Create an empty property set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            scopes: BTreeMap::new(),
        }
    }

    /// Return a copy with `key` set to `value` in `scope`.
    #[must_use]
    pub fn with(
        &self,
        scope: PropertyScope,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        let mut next = self.clone();
        next.scopes
            .entry(scope)
            .or_default()
            .insert(key.into(), value.into());
        next
    }

    /// Return a copy without `key` in `scope`.
    #[must_use]
    pub fn without(&self, scope: PropertyScope, key: &str) -> Self {
        let mut next = self.clone();
        if let Some(values) = next.scopes.get_mut(&scope) {
            values.remove(key);
            if values.is_empty() {
                next.scopes.remove(&scope);
            }
        }
        next
    }

    /// Look up a raw value.
    #[must_use]
    pub fn get(&self, scope: PropertyScope, key: &str) -> Option<&PropertyValue> {
        self.scopes.get(&scope).and_then(|values| values.get(key))
    }

    /// Look up a text value.
    #[must_use]
    pub fn get_str(&self, scope: PropertyScope, key: &str) -> Option<&str> {
        match self.get(scope, key) {
            Some(PropertyValue::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Look up an integer value.
    #[must_use]
    pub fn get_i64(&self, scope: PropertyScope, key: &str) -> Option<i64> {
        match self.get(scope, key) {
            Some(PropertyValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    /// Look up a boolean value.
    #[must_use]
    pub fn get_bool(&self, scope: PropertyScope, key: &str) -> Option<bool> {
        match self.get(scope, key) {
            Some(PropertyValue::Boolean(value)) => Some(*value),
            _ => None,
        }
    }

    /// Iterate the keys and values of one scope.
    pub fn scope(&self, scope: PropertyScope) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.scopes
            .get(&scope)
            .into_iter()
            .flat_map(|values| values.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Return a copy with every property of `scope` removed.
    ///
    /// Used to drop the invocation scope when an event crosses an
    /// asynchronous boundary.
    #[must_use]
    pub fn without_scope(&self, scope: PropertyScope) -> Self {
        let mut next = self.clone();
        next.scopes.remove(&scope);
        next
    }

    /// Total number of properties across all scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.values().map(BTreeMap::len).sum()
    }

    /// Whether no property is set in any scope.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A payload together with its scoped properties.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    payload: Payload,
    properties: Properties,
}

impl Message {
    /// Create a message with the given payload and no properties.
    #[must_use]
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            properties: Properties::new(),
        }
    }

    /// Create a text message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Payload::Text(text.into()))
    }

    /// Create a collection message.
    #[must_use]
    pub fn collection(messages: Vec<Self>) -> Self {
        Self::new(Payload::Collection(messages))
    }

    /// The payload.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The scoped properties.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Render the payload as a string.
    #[must_use]
    pub fn as_string(&self) -> String {
        self.payload.as_string()
    }

    /// Return a copy carrying a different payload.
    #[must_use]
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            properties: self.properties.clone(),
        }
    }

    /// Return a copy with one property set.
    #[must_use]
    pub fn with_property(
        &self,
        scope: PropertyScope,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        Self {
            payload: self.payload.clone(),
            properties: self.properties.with(scope, key, value),
        }
    }

    /// Return a copy with the whole property set replaced.
    #[must_use]
    pub fn with_properties(&self, properties: Properties) -> Self {
        Self {
            payload: self.payload.clone(),
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_renders_members() {
        let message = Message::collection(vec![Message::text("a"), Message::text("b")]);
        assert_eq!(message.as_string(), "[a,b]");
        assert_eq!(message.payload().collection_len(), Some(2));
    }

    #[test]
    fn test_properties_are_copy_on_write() {
        let original = Properties::new().with(PropertyScope::Session, "user", "alice");
        let changed = original.with(PropertyScope::Session, "user", "bob");

        assert_eq!(original.get_str(PropertyScope::Session, "user"), Some("alice"));
        assert_eq!(changed.get_str(PropertyScope::Session, "user"), Some("bob"));
    }

    #[test]
    fn test_typed_accessor_rejects_other_types() {
        let props = Properties::new().with(PropertyScope::Outbound, "count", 7_i64);
        assert_eq!(props.get_i64(PropertyScope::Outbound, "count"), Some(7));
        assert_eq!(props.get_str(PropertyScope::Outbound, "count"), None);
        assert_eq!(props.get_i64(PropertyScope::Inbound, "count"), None);
    }

    #[test]
    fn test_without_removes_empty_scope() {
        let props = Properties::new()
            .with(PropertyScope::Invocation, "k", true)
            .without(PropertyScope::Invocation, "k");
        assert!(props.is_empty());
        assert_eq!(props.scope(PropertyScope::Invocation).count(), 0);
    }

    #[test]
    fn test_bytes_render_lossy() {
        let payload = Payload::Bytes(b"hello".to_vec());
        assert_eq!(payload.as_string(), "hello");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn scope() -> impl Strategy<Value = PropertyScope> {
            prop_oneof![
                Just(PropertyScope::Inbound),
                Just(PropertyScope::Outbound),
                Just(PropertyScope::Invocation),
                Just(PropertyScope::Session),
            ]
        }

        proptest! {
            #[test]
            fn scopes_never_leak(set in scope(), other in scope(), key in "[a-z]{1,8}", value in any::<i64>()) {
                let props = Properties::new().with(set, key.clone(), value);
                prop_assert_eq!(props.get_i64(set, &key), Some(value));
                if other != set {
                    prop_assert_eq!(props.get(other, &key), None);
                }
                prop_assert!(props.without_scope(set).is_empty());
            }
        }
    }
}
