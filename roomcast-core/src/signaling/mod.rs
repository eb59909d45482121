//! Signaling messages exchanged between participants
//!
//! Every message travels in a [`SignalEnvelope`] `{type, sender, receiver,
//! data, sent}`. The server stamps `sender`; clients address a peer with
//! `receiver` or leave it empty to broadcast.

pub mod hub;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::PeerId;

/// Recognized envelope `type` values
pub mod kinds {
    pub const USER_CONNECTED: &str = "user:connected";
    pub const USER_DISCONNECTED: &str = "user:disconnected";
    pub const USER_LIST: &str = "user:list";
    pub const SDP: &str = "sdp";
    pub const ICE: &str = "ice";
    pub const CONNECTION_CLOSE: &str = "connection:close";
    pub const RECEIVER_STOP: &str = "receiver:stop";
    pub const ARCHITECTURE_SWITCH: &str = "architecture:switch";
}

/// Receiver name for requests handled by the signaling server itself
pub const SERVER: &str = "@server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub const fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Wire envelope for every signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<PeerId>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<String>,
}

/// Typed view of an envelope's `type` and `data`
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    UserConnected(PeerId),
    UserDisconnected(PeerId),
    UserList(Vec<PeerId>),
    Sdp(SessionDescription),
    Ice(Option<IceCandidate>),
    ConnectionClose,
    ReceiverStop(String),
    /// `None` asks the server to announce its current value
    TopologySwitch(Option<String>),
    Other(String),
}

impl SignalEnvelope {
    /// Build an outbound envelope, timestamped now
    pub fn new(kind: impl Into<String>, receiver: Option<PeerId>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            sender: None,
            receiver,
            data,
            sent: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn sdp(receiver: &PeerId, description: &SessionDescription) -> Result<Self> {
        Ok(Self::new(
            kinds::SDP,
            Some(receiver.clone()),
            serde_json::to_value(description)?,
        ))
    }

    pub fn ice(receiver: &PeerId, candidate: Option<&IceCandidate>) -> Result<Self> {
        Ok(Self::new(
            kinds::ICE,
            Some(receiver.clone()),
            serde_json::to_value(candidate)?,
        ))
    }

    #[must_use]
    pub fn connection_close(receiver: &PeerId) -> Self {
        Self::new(
            kinds::CONNECTION_CLOSE,
            Some(receiver.clone()),
            Value::String("immediately".to_string()),
        )
    }

    #[must_use]
    pub fn receiver_stop(receiver: &PeerId, mid: &str) -> Self {
        Self::new(
            kinds::RECEIVER_STOP,
            Some(receiver.clone()),
            Value::String(mid.to_string()),
        )
    }

    #[must_use]
    pub fn topology_switch(receiver: Option<PeerId>, topology: Option<&str>) -> Self {
        let data = topology.map_or(Value::Null, |t| Value::String(t.to_string()));
        Self::new(kinds::ARCHITECTURE_SWITCH, receiver, data)
    }

    /// Stamp the sender, as the server does on receipt
    #[must_use]
    pub fn from_sender(mut self, sender: PeerId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Decode the typed payload
    pub fn signal(&self) -> Result<Signal> {
        let signal = match self.kind.as_str() {
            kinds::USER_CONNECTED => Signal::UserConnected(self.peer_data()?),
            kinds::USER_DISCONNECTED => Signal::UserDisconnected(self.peer_data()?),
            kinds::USER_LIST => Signal::UserList(serde_json::from_value(self.data.clone())?),
            kinds::SDP => Signal::Sdp(serde_json::from_value(self.data.clone())?),
            kinds::ICE => Signal::Ice(serde_json::from_value(self.data.clone())?),
            kinds::CONNECTION_CLOSE => Signal::ConnectionClose,
            kinds::RECEIVER_STOP => match &self.data {
                Value::String(mid) => Signal::ReceiverStop(mid.clone()),
                other => {
                    return Err(Error::Signaling(format!(
                        "receiver:stop expects a mid string, got {other}"
                    )))
                }
            },
            kinds::ARCHITECTURE_SWITCH => match &self.data {
                Value::String(name) => Signal::TopologySwitch(Some(name.clone())),
                Value::Null => Signal::TopologySwitch(None),
                other => {
                    return Err(Error::Signaling(format!(
                        "architecture:switch expects a name, got {other}"
                    )))
                }
            },
            other => Signal::Other(other.to_string()),
        };
        Ok(signal)
    }

    fn peer_data(&self) -> Result<PeerId> {
        match &self.data {
            Value::String(name) if !name.is_empty() => Ok(PeerId::new(name.clone())),
            other => Err(Error::Signaling(format!(
                "{} expects a peer name, got {other}",
                self.kind
            ))),
        }
    }
}

/// Outbound half of the signaling channel
#[cfg_attr(test, mockall::automock)]
pub trait SignalingLink: Send + Sync {
    fn send(&self, envelope: SignalEnvelope) -> Result<()>;
}

/// Signaling link backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

impl ChannelLink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalingLink for ChannelLink {
    fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| Error::Closed("signaling channel".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_browser_shaped_envelopes() {
        let list: SignalEnvelope = serde_json::from_value(json!({
            "type": "user:list",
            "sender": "@server",
            "data": ["alice", "bob"],
            "sent": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(
            list.signal().unwrap(),
            Signal::UserList(vec![PeerId::from("alice"), PeerId::from("bob")])
        );

        let sdp: SignalEnvelope = serde_json::from_value(json!({
            "type": "sdp",
            "sender": "bob",
            "receiver": "alice",
            "data": {"type": "offer", "sdp": "v=0\r\n"}
        }))
        .unwrap();
        assert_eq!(
            sdp.signal().unwrap(),
            Signal::Sdp(SessionDescription::offer("v=0\r\n"))
        );

        let ice: SignalEnvelope = serde_json::from_value(json!({
            "type": "ice",
            "sender": "bob",
            "data": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        let Signal::Ice(Some(candidate)) = ice.signal().unwrap() else {
            panic!("expected a candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_null_ice_is_end_of_candidates() {
        let envelope = SignalEnvelope::ice(&PeerId::from("bob"), None).unwrap();
        assert_eq!(envelope.signal().unwrap(), Signal::Ice(None));
    }

    #[test]
    fn test_constructors_address_the_receiver() {
        let bob = PeerId::from("bob");
        let close = SignalEnvelope::connection_close(&bob);
        assert_eq!(close.kind, kinds::CONNECTION_CLOSE);
        assert_eq!(close.receiver.as_ref(), Some(&bob));
        assert!(close.sent.is_some());
        assert_eq!(close.signal().unwrap(), Signal::ConnectionClose);

        let stop = SignalEnvelope::receiver_stop(&bob, "alice:3");
        assert_eq!(stop.signal().unwrap(), Signal::ReceiverStop("alice:3".to_string()));

        let offer = SignalEnvelope::sdp(&bob, &SessionDescription::offer("x")).unwrap();
        assert_eq!(offer.data, json!({"type": "offer", "sdp": "x"}));
    }

    #[test]
    fn test_malformed_membership_payload_is_rejected() {
        let envelope = SignalEnvelope::new(kinds::USER_CONNECTED, None, json!(42));
        assert!(matches!(envelope.signal(), Err(Error::Signaling(_))));
    }

    #[test]
    fn test_unknown_type_is_passed_through() {
        let envelope = SignalEnvelope::new("chat", None, json!("hi"));
        assert_eq!(envelope.signal().unwrap(), Signal::Other("chat".to_string()));
    }

    #[tokio::test]
    async fn test_channel_link_delivers_and_reports_closed() {
        let (link, mut rx) = ChannelLink::new();
        link.send(SignalEnvelope::topology_switch(None, Some("sfu")))
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(
            received.signal().unwrap(),
            Signal::TopologySwitch(Some("sfu".to_string()))
        );

        drop(rx);
        assert!(link
            .send(SignalEnvelope::topology_switch(None, None))
            .unwrap_err()
            .is_closed());
    }
}
