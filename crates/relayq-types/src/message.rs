//! Message and delivery types for RelayQ
//!
//! A `Message` is what a producer publishes; a `Delivery` is one received
//! instance of a message, owned by the dispatch loop until it is settled.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-assigned tag identifying one delivery on a connection.
///
/// Tags are monotonic per connection; a redelivery of the same message
/// gets a fresh tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as published by a producer.
///
/// Immutable once received; per-delivery state (attempt count, redelivery
/// flag) lives on [`Delivery`], not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Message body (raw bytes)
    #[serde(with = "bytes_serde")]
    pub body: Bytes,

    /// Content type (e.g., "application/json")
    pub content_type: Option<String>,

    /// Custom attributes/headers
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// When the message was created
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            body: body.into(),
            content_type: None,
            attributes: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a new message with JSON content
    pub fn json<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(data)?;
        let mut msg = Self::new(body);
        msg.content_type = Some("application/json".to_string());
        Ok(msg)
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserialize the body as JSON
    pub fn body_as_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// One received instance of a message.
///
/// Owned by the dispatch loop from receipt until it is acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The message as published
    pub message: Message,

    /// Queue this delivery came from
    pub queue: String,

    /// Broker-assigned delivery tag
    pub tag: DeliveryTag,

    /// True if this message was delivered before and nacked back
    pub redelivered: bool,

    /// Delivery attempt number, starting at 1
    pub attempt: u32,

    /// When the broker handed this delivery to the consumer
    pub received_at: DateTime<Utc>,
}

/// Custom serialization for Bytes.
///
/// UTF-8 bodies serialize as a plain string; anything else as a tagged
/// base64 string. UTF-8 bodies that happen to start with the tag are
/// base64-encoded too, so decoding is unambiguous and every body
/// round-trips byte for byte.
mod bytes_serde {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const BASE64_TAG: &str = "base64:";

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match std::str::from_utf8(bytes) {
            Ok(s) if !s.starts_with(BASE64_TAG) => s.serialize(serializer),
            _ => format!("{}{}", BASE64_TAG, STANDARD.encode(bytes)).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.strip_prefix(BASE64_TAG) {
            Some(encoded) => {
                let decoded = STANDARD.decode(encoded).map_err(serde::de::Error::custom)?;
                Ok(Bytes::from(decoded))
            }
            None => Ok(Bytes::from(s)),
        }
    }
}
