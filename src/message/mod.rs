//! Message Model
//!
//! Messages carry an immutable identity, a property map, a delivery state
//! and a body. The body is cheap to clone: inline bodies share a `Bytes`
//! buffer and large bodies share a spool file handle.

use std::collections::BTreeMap;
use std::fmt;

use bincode::{Decode, Encode};
use bytes::Bytes;
use uuid::Uuid;

use crate::relay::Body;

/// Globally unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct MessageId(u128);

impl MessageId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().as_u128())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0).hyphenated())
    }
}

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Waiting on a binding for a consumer
    Pending,
    /// Handed to a consumer, not yet acknowledged
    DeliveredUnacked,
    /// Acknowledged by the consumer holding it
    Acked,
}

/// A message property value
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        PropertyValue::Bytes(value)
    }
}

/// Message properties, ordered by key so they encode deterministically
pub type Properties = BTreeMap<String, PropertyValue>;

/// A queued message
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    state: DeliveryState,
    properties: Properties,
    body: Body,
    /// Number of times this message has been handed to a consumer
    delivery_count: u32,
}

impl Message {
    /// Create a pending message with a fresh id
    pub fn new(body: impl Into<Body>) -> Self {
        Self::with_id(MessageId::new(), body)
    }

    /// Create a pending message with a known id (used for transfers)
    pub fn with_id(id: MessageId, body: impl Into<Body>) -> Self {
        Self {
            id,
            state: DeliveryState::Pending,
            properties: Properties::new(),
            body: body.into(),
            delivery_count: 0,
        }
    }

    /// Builder-style property setter
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DeliveryState) {
        self.state = state;
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Get a string property, if present and a string
    pub fn string_property(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub(crate) fn set_delivery_count(&mut self, count: u32) {
        self.delivery_count = count;
    }

    /// True once the message has been delivered more than once
    pub fn is_redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    pub(crate) fn mark_delivered(&mut self) {
        self.delivery_count = self.delivery_count.saturating_add(1);
        self.state = DeliveryState::DeliveredUnacked;
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Inline(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Inline(Bytes::from(bytes))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Inline(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Inline(Bytes::from(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_unique_and_displayed_as_uuid() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);

        let text = a.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(Uuid::parse_str(&text).unwrap().as_u128(), a.as_u128());
    }

    #[test]
    fn test_new_message_is_pending() {
        let msg = Message::new("hello");
        assert_eq!(msg.state(), DeliveryState::Pending);
        assert_eq!(msg.delivery_count(), 0);
        assert!(!msg.is_redelivered());
        assert_eq!(msg.body().len(), 5);
    }

    #[test]
    fn test_properties() {
        let msg = Message::new("x")
            .with_property("fileName", "file_3")
            .with_property("size", 42i64);

        assert_eq!(msg.string_property("fileName"), Some("file_3"));
        assert_eq!(msg.property("size"), Some(&PropertyValue::Int(42)));
        assert_eq!(msg.string_property("size"), None);
        assert_eq!(msg.string_property("missing"), None);
    }

    #[test]
    fn test_mark_delivered_counts_redeliveries() {
        let mut msg = Message::new("x");
        msg.mark_delivered();
        assert_eq!(msg.state(), DeliveryState::DeliveredUnacked);
        assert!(!msg.is_redelivered());

        msg.set_state(DeliveryState::Pending);
        msg.mark_delivered();
        assert!(msg.is_redelivered());
    }

    #[test]
    fn test_clone_shares_id() {
        let msg = Message::new(vec![1u8, 2, 3]);
        let copy = msg.clone();
        assert_eq!(msg.id(), copy.id());
    }
}
