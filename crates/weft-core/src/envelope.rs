use bytes::Bytes;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::ContextId;
use crate::ids::MessageId;

/// Delivery mode of a message.
///
/// Every `request` eventually produces exactly one `response` with the same
/// correlation id, or a timeout error. Fire-and-forget has no response.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mode {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "fire-and-forget")]
    FireAndForget,
}

/// Message destination: a single context or every currently-known context.
///
/// On the wire, broadcast is the literal string `"*"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Context(ContextId),
    Broadcast,
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Context(id) => serializer.serialize_str(id.as_str()),
            Self::Broadcast => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "*" {
            Ok(Self::Broadcast)
        } else if s.is_empty() {
            Err(D::Error::custom("empty message target"))
        } else {
            Ok(Self::Context(ContextId::from_raw(s)))
        }
    }
}

/// The wire shape of a message, stable across versions.
///
/// `{id, from, to|"*", kind, mode, payload: base64 bytes, deadlineMs|null}`.
/// Receivers ignore unknown fields (forward compatibility).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub from: ContextId,
    pub to: Target,
    pub kind: String,
    pub mode: Mode,
    #[serde(with = "b64_payload")]
    pub payload: Bytes,
    #[serde(rename = "deadlineMs", default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl Envelope {
    pub fn request(
        from: ContextId,
        to: ContextId,
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            from,
            to: Target::Context(to),
            kind: kind.into(),
            mode: Mode::Request,
            payload: payload.into(),
            deadline_ms: None,
        }
    }

    pub fn fire_and_forget(
        from: ContextId,
        to: Target,
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            from,
            to,
            kind: kind.into(),
            mode: Mode::FireAndForget,
            payload: payload.into(),
            deadline_ms: None,
        }
    }

    /// Build the response to a request, carrying the request's correlation id.
    pub fn response_to(request: &Envelope, from: ContextId, payload: impl Into<Bytes>) -> Self {
        Self {
            id: request.id.clone(),
            from,
            to: Target::Context(request.from.clone()),
            kind: request.kind.clone(),
            mode: Mode::Response,
            payload: payload.into(),
            deadline_ms: None,
        }
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

mod b64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}
