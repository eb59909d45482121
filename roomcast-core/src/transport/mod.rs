//! Real-time transport seam
//!
//! [`PeerTransport`] is the capability a session negotiates over: the
//! offer/answer description state, ICE candidates and transceivers. ICE,
//! DTLS and SRTP themselves live behind this trait. [`webrtc`] drives a real
//! `RTCPeerConnection`; [`memory`] provides an in-process implementation that
//! exchanges a minimal textual description.

pub mod memory;
pub mod webrtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::types::{PeerId, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    #[must_use]
    pub const fn sends(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }

    #[must_use]
    pub const fn receives(self) -> bool {
        matches!(self, Self::SendRecv | Self::RecvOnly)
    }

    /// Same direction with the sending half removed
    #[must_use]
    pub const fn without_send(self) -> Self {
        match self {
            Self::SendRecv | Self::RecvOnly => Self::RecvOnly,
            Self::SendOnly | Self::Inactive => Self::Inactive,
        }
    }

    /// Direction as seen from the other end
    #[must_use]
    pub const fn reversed(self) -> Self {
        match self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            other => other,
        }
    }
}

impl fmt::Display for TransceiverDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransceiverDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sendrecv" => Ok(Self::SendRecv),
            "sendonly" => Ok(Self::SendOnly),
            "recvonly" => Ok(Self::RecvOnly),
            "inactive" => Ok(Self::Inactive),
            _ => Err(Error::Transport(format!("unknown direction {s:?}"))),
        }
    }
}

/// Index of a transceiver within its transport
pub type TransceiverId = usize;

#[derive(Debug, Clone)]
pub struct TransceiverInfo {
    pub id: TransceiverId,
    pub mid: Option<String>,
    pub kind: TrackKind,
    pub direction: TransceiverDirection,
    pub sender_track: Option<Arc<MediaTrack>>,
    pub receiver_track: Option<Arc<MediaTrack>>,
}

/// RTP counters for one direction of a transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCounters {
    pub bytes: u64,
    pub packets: u64,
    pub packets_lost: u64,
}

impl RtpCounters {
    /// Counters accumulated since `earlier`
    #[must_use]
    pub const fn since(&self, earlier: &Self) -> Self {
        Self {
            bytes: self.bytes.saturating_sub(earlier.bytes),
            packets: self.packets.saturating_sub(earlier.packets),
            packets_lost: self.packets_lost.saturating_sub(earlier.packets_lost),
        }
    }
}

/// Cumulative transmission counters since the transport was created
///
/// Outbound loss is what the remote end reports back about our packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub inbound: RtpCounters,
    pub outbound: RtpCounters,
}

/// Notifications from the transport to its owning session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Local changes need an offer/answer round
    NegotiationNeeded,
    /// A gathered local candidate; `None` marks the end of gathering
    IceCandidate(Option<IceCandidate>),
    /// A remote track started arriving
    Track {
        track: Arc<MediaTrack>,
        streams: Vec<Arc<MediaStream>>,
        mid: String,
    },
    IceConnectionStateChanged(IceConnectionState),
    SignalingStateChanged(SignalingState),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    /// Pending local description if any, else the current one
    fn local_description(&self) -> Option<SessionDescription>;

    /// Pending remote description if any, else the current one
    fn remote_description(&self) -> Option<SessionDescription>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description; a `rollback` discards a pending local offer
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote description; a `rollback` discards a pending remote offer
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn add_transceiver(
        &self,
        track: Arc<MediaTrack>,
        direction: TransceiverDirection,
        streams: &[StreamId],
    ) -> Result<TransceiverId>;

    fn transceivers(&self) -> Vec<TransceiverInfo>;

    fn set_direction(&self, id: TransceiverId, direction: TransceiverDirection) -> Result<()>;

    /// Swap the outgoing track without renegotiating; `None` sends nothing
    fn replace_sender_track(&self, id: TransceiverId, track: Option<Arc<MediaTrack>>)
        -> Result<()>;

    fn restart_ice(&self);

    async fn stats(&self) -> Result<TransportStats>;

    fn close(&self);

    /// Take the event stream; only the first caller gets it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

/// Creates one transport per remote peer
pub trait TransportFactory: Send + Sync {
    fn create(&self, local: &PeerId, remote: &PeerId) -> Result<Arc<dyn PeerTransport>>;
}
