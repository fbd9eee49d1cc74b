use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Name of the mandatory discriminator field on every frame.
pub const TYPE_FIELD: &str = "type";

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame text is not valid JSON.
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is valid JSON but not an object.
    #[error("frame is not a json object")]
    NotAnObject,

    /// Frame object has no string `type` field.
    #[error("frame has no string `type` field")]
    MissingType,
}

/// One JSON message exchanged over the channel.
///
/// The `type` field is guaranteed to be present and to be a string. Every
/// other field is opaque payload and is passed through verbatim.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Frame {
    fields: Map<String, Value>,
}

impl Frame {
    /// Creates a frame with only the `type` field set.
    pub fn new(tag: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_FIELD.to_string(), Value::String(tag.into()));
        Self { fields }
    }

    /// Adds or replaces a payload field.
    ///
    /// Setting `type` through this method is ignored so the discriminator
    /// always stays a string.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != TYPE_FIELD {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Parses raw frame text.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Builds a frame from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(fields) = value else {
            return Err(FrameError::NotAnObject);
        };
        if !matches!(fields.get(TYPE_FIELD), Some(Value::String(tag)) if !tag.is_empty()) {
            return Err(FrameError::MissingType);
        }
        Ok(Self { fields })
    }

    /// Serializes any value that encodes to an object with a `type` field.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, FrameError> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Returns the routing tag.
    pub fn tag(&self) -> &str {
        self.fields
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Returns a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns all fields, including `type`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Converts the frame back into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Encodes the frame as websocket text.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }

    /// Decodes the frame into a caller-defined type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// Decodes the frame into one of the known server events.
    pub fn server_event(&self) -> Result<ServerEvent, serde_json::Error> {
        self.decode()
    }
}

/// Registry key for subscribers.
///
/// Reserved topics are synthesized locally and live in their own namespace:
/// a server frame with `type: "connected"` routes to `Tag("connected")`, never
/// to `Connected`.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Topic {
    /// The channel became live.
    Connected,
    /// A live connection was lost or torn down.
    Disconnected,
    /// Automatic reconnection gave up.
    ReconnectExhausted,
    /// Every successfully parsed frame, after its tag-specific handlers.
    AnyMessage,
    /// Frames whose `type` equals this tag.
    Tag(String),
}

impl From<&str> for Topic {
    fn from(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }
}

impl From<String> for Topic {
    fn from(tag: String) -> Self {
        Self::Tag(tag)
    }
}

/// Server events published by the scheduling service.
///
/// This is an optional typed view; the channel itself routes by tag only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Status change of one of the user's charging requests.
    ChargeStatusChange {
        request_id: i64,
        status: String,
        #[serde(default)]
        data: Value,
    },
    /// Admin copy of a charging request status change.
    AdminChargeStatusChange {
        user_id: String,
        request_id: i64,
        status: String,
        #[serde(default)]
        data: Value,
    },
    /// Charging pile went online, offline, faulted, etc.
    PileStatusChange {
        pile_id: i64,
        status: String,
        #[serde(default)]
        data: Value,
    },
    /// Waiting queue for a charging mode changed.
    QueueUpdate {
        mode: String,
        #[serde(default)]
        data: Value,
    },
}

impl ServerEvent {
    /// Returns the wire tag of this event.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ChargeStatusChange { .. } => "charge_status_change",
            Self::AdminChargeStatusChange { .. } => "admin_charge_status_change",
            Self::PileStatusChange { .. } => "pile_status_change",
            Self::QueueUpdate { .. } => "queue_update",
        }
    }
}
