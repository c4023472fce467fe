use core::fmt::{self, Display, Formatter};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lex::Lex;
use crate::node::Graph;

/// Number of random bytes in a message id. Hex-encoded on the wire.
const ID_BYTES: usize = 9;

/// Random token identifying a wire message, used for ack correlation and
/// deduplication.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// A fresh random id.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0_u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handshake payload carrying the peer's stable id (its public key). Sent
/// once per connection; the claimed id keys the finger table while the
/// transport connection id remains the delivery handle.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Hello {
    #[serde(rename = "pub")]
    pub peer_id: String,
}

/// The JSON envelope exchanged between peers.
///
/// `id` is a fresh random token; `reply_to` references the id being
/// answered. At most one of `get` / `put` carries the payload; `err`
/// reports a failure in-band on replies.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct WireMessage {
    #[serde(rename = "#")]
    pub id: MessageId,

    #[serde(rename = "@", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hello: Option<Hello>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<Lex>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<Graph>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("malformed wire message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl WireMessage {
    /// A fresh message with a random id and no payload.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: MessageId::random(),
            reply_to: None,
            hello: None,
            get: None,
            put: None,
            err: None,
        }
    }

    #[must_use]
    pub fn get(lex: Lex) -> Self {
        let mut msg = Self::new();
        msg.get = Some(lex);
        msg
    }

    #[must_use]
    pub fn put(graph: Graph) -> Self {
        let mut msg = Self::new();
        msg.put = Some(graph);
        msg
    }

    #[must_use]
    pub fn hello(peer_id: String) -> Self {
        let mut msg = Self::new();
        msg.hello = Some(Hello { peer_id });
        msg
    }

    /// A reply to `to`, carrying either a subgraph or an error.
    #[must_use]
    pub fn ack(to: &MessageId, put: Option<Graph>, err: Option<String>) -> Self {
        let mut msg = Self::new();
        msg.reply_to = Some(to.clone());
        msg.put = put;
        msg.err = err;
        msg
    }

    /// Parse a frame. JSON numbers are finite by construction, so no
    /// further state validation is required here.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Encode to a frame. Infallible for the shapes this type can hold.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Default for WireMessage {
    fn default() -> Self {
        Self::new()
    }
}
