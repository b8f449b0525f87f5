//! Wire format.
//!
//! Inbound frames are flat JSON objects tagged by `event`:
//!
//! ```json
//! {"event": "call", "calleeId": "bob", "rtcMessage": {"sdp": "..."}}
//! ```
//!
//! Outbound frames wrap the forwarded fields in `data`:
//!
//! ```json
//! {"event": "newCall", "data": {"callerId": "alice", "rtcMessage": {"sdp": "..."}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::identity::Identity;

/// Events a client may send.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event")]
pub enum InboundMessage {
    /// Liveness probe, echoed back to the sending connection.
    #[serde(rename = "ping")]
    Ping {
        /// Opaque payload to echo.
        data: Value,
    },
    /// Offer a call to `callee_id`.
    #[serde(rename = "call")]
    Call {
        /// Mailbox to deliver the offer to.
        #[serde(rename = "calleeId")]
        callee_id: Identity,
        /// Session description, passed through untouched.
        #[serde(rename = "rtcMessage")]
        rtc_message: Value,
    },
    /// Accept a call from `caller_id`.
    #[serde(rename = "answerCall")]
    AnswerCall {
        /// Mailbox of the original caller.
        #[serde(rename = "callerId")]
        caller_id: Identity,
        /// Session description, passed through untouched.
        #[serde(rename = "rtcMessage")]
        rtc_message: Value,
    },
    /// Hang up on `caller_id`.
    #[serde(rename = "callEnding")]
    CallEnding {
        /// Mailbox of the peer to notify.
        #[serde(rename = "callerId")]
        caller_id: Identity,
    },
    /// Trickle an ICE candidate to `callee_id`.
    #[serde(rename = "ICEcandidate")]
    IceCandidate {
        /// Mailbox of the peer receiving the candidate.
        #[serde(rename = "calleeId")]
        callee_id: Identity,
        /// Candidate payload, passed through untouched.
        #[serde(rename = "rtcMessage")]
        rtc_message: Value,
    },
}

impl InboundMessage {
    /// Wire name of the event.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Call { .. } => "call",
            Self::AnswerCall { .. } => "answerCall",
            Self::CallEnding { .. } => "callEnding",
            Self::IceCandidate { .. } => "ICEcandidate",
        }
    }
}

/// Every inbound event name the relay understands.
pub const INBOUND_EVENTS: [&str; 5] = ["ping", "call", "answerCall", "callEnding", "ICEcandidate"];

/// Events the relay forwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundMessage {
    /// Reply to `ping`.
    #[serde(rename = "pong")]
    Pong(Value),
    /// Incoming call offer.
    #[serde(rename = "newCall")]
    NewCall {
        /// Identity that placed the call.
        #[serde(rename = "callerId")]
        caller_id: Identity,
        /// Session description from the caller.
        #[serde(rename = "rtcMessage")]
        rtc_message: Value,
    },
    /// The callee accepted.
    #[serde(rename = "callAnswered")]
    CallAnswered {
        /// Identity that answered.
        callee: Identity,
        /// Session description from the callee.
        #[serde(rename = "rtcMessage")]
        rtc_message: Value,
    },
    /// The peer hung up.
    #[serde(rename = "callEnd")]
    CallEnd {},
    /// ICE candidate from a peer.
    #[serde(rename = "ICEcandidate")]
    IceCandidate {
        /// Identity that produced the candidate.
        sender: Identity,
        /// Candidate payload.
        #[serde(rename = "rtcMessage")]
        rtc_message: Value,
    },
}

impl OutboundMessage {
    /// Wire name of the event.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Pong(_) => "pong",
            Self::NewCall { .. } => "newCall",
            Self::CallAnswered { .. } => "callAnswered",
            Self::CallEnd {} => "callEnd",
            Self::IceCandidate { .. } => "ICEcandidate",
        }
    }
}

/// Why an inbound frame could not be turned into an [`InboundMessage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not a JSON object. Closes the connection.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// No string `event` field.
    #[error("frame has no event field")]
    MissingEvent,
    /// `event` names something the relay does not handle.
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    /// A known event with missing or mistyped fields.
    #[error("invalid {event} payload: {source}")]
    InvalidPayload {
        /// Event that failed to decode.
        event: String,
        /// Field-level cause.
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Whether this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingEvent => "missing_event",
            Self::UnknownEvent(_) => "unknown_event",
            Self::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<InboundMessage, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::Malformed("expected a JSON object".into()));
    }
    let event = match value.get("event").and_then(Value::as_str) {
        Some(event) => event.to_owned(),
        None => return Err(DecodeError::MissingEvent),
    };
    if !INBOUND_EVENTS.contains(&event.as_str()) {
        return Err(DecodeError::UnknownEvent(event));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload { event, source })
}

/// Serialize an outbound message.
pub fn encode(message: &OutboundMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
