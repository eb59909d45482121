//! Peer sessions
//!
//! A [`PeerSession`] owns one transport towards one remote participant and
//! runs the perfect-negotiation protocol over it:
//! - the lexicographically greater name is polite and yields on glare
//! - the impolite side ignores a colliding offer, the polite side rolls back
//! - at most one local offer is in flight; further triggers are coalesced
//! - early ICE candidates are retried until a remote description exists
//!
//! Each session is an actor: the handle posts inputs to a single task that
//! serializes every description mutation. [`PeerSession::report`] and
//! [`PeerSession::snapshot`] read transport counters for status output.

mod actor;
mod candidates;
mod report;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use crate::config::NegotiationConfig;
use crate::error::{Error, Result};
use crate::events::EventEmitter;
use crate::logging;
use crate::media::{Media, MediaConsumer, MediaSelector, MediaStream, MediaTrack};
use crate::signaling::{SessionDescription, SignalEnvelope, SignalingLink};
use crate::transport::{PeerTransport, SignalingState, TransceiverId};
use crate::types::{PeerId, StreamId};

use actor::SessionActor;
pub use report::{ConnectionReport, DirectionReport, SessionSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl From<SignalingState> for NegotiationPhase {
    fn from(state: SignalingState) -> Self {
        match state {
            SignalingState::Stable => Self::Stable,
            SignalingState::HaveLocalOffer => Self::HaveLocalOffer,
            SignalingState::HaveRemoteOffer => Self::HaveRemoteOffer,
            SignalingState::Closed => Self::Closed,
        }
    }
}

/// Who yields when both sides offer at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Politeness {
    /// The lexicographically greater name is polite
    #[default]
    Auto,
    Polite,
    Impolite,
}

impl Politeness {
    #[must_use]
    pub fn is_polite(self, local: &PeerId, peer: &PeerId) -> bool {
        match self {
            Self::Auto => local > peer,
            Self::Polite => true,
            Self::Impolite => false,
        }
    }
}

impl FromStr for Politeness {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "polite" => Ok(Self::Polite),
            "impolite" => Ok(Self::Impolite),
            _ => Err(Error::Configuration(format!(
                "politeness must be auto, polite or impolite, got {s:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub politeness: Politeness,
    pub ice_retry_interval: Duration,
    pub ice_retry_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            politeness: Politeness::Auto,
            ice_retry_interval: Duration::from_millis(100),
            ice_retry_attempts: 20,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &NegotiationConfig) -> Result<Self> {
        Ok(Self {
            politeness: config.politeness.parse()?,
            ice_retry_interval: config.ice_retry_interval(),
            ice_retry_attempts: config.ice_retry_attempts,
        })
    }

    #[must_use]
    pub const fn with_politeness(mut self, politeness: Politeness) -> Self {
        self.politeness = politeness;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TrackAdded {
        track: Arc<MediaTrack>,
        streams: Vec<Arc<MediaStream>>,
    },
    TrackRemoved {
        track: Arc<MediaTrack>,
    },
    StreamAdded(Arc<MediaStream>),
    StreamRemoved(Arc<MediaStream>),
    MediaChanged {
        change: ChangeKind,
        track: Arc<MediaTrack>,
        streams: Vec<Arc<MediaStream>>,
    },
    NegotiationStarted,
    NegotiationFinished,
    Closed,
}

/// A track this side sends
#[derive(Debug, Clone)]
pub(crate) struct LocalTrack {
    pub(crate) track: Arc<MediaTrack>,
    pub(crate) streams: Vec<StreamId>,
    /// `None` while attachment is deferred
    pub(crate) transceiver: Option<TransceiverId>,
    pub(crate) muted: bool,
}

pub(crate) enum Command {
    AddMedia(Media),
    RemoveMedia(MediaSelector),
    Mute {
        selector: MediaSelector,
        muted: bool,
    },
    ReplaceTrack {
        selector: MediaSelector,
        track: Arc<MediaTrack>,
    },
    Renegotiate,
    Close,
}

pub(crate) enum SessionInput {
    Signal {
        envelope: SignalEnvelope,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    },
    Command {
        command: Command,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    },
    RetryCandidates,
    RemoteTrackEnded(crate::types::TrackId),
    Ping(oneshot::Sender<()>),
}

pub(crate) struct SessionShared {
    pub(crate) local: PeerId,
    pub(crate) peer: PeerId,
    pub(crate) polite: bool,
    pub(crate) phase: RwLock<NegotiationPhase>,
    pub(crate) offering: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) local_tracks: RwLock<Vec<LocalTrack>>,
    pub(crate) remote_tracks: RwLock<Vec<Arc<MediaTrack>>>,
    pub(crate) remote_streams: RwLock<Vec<Arc<MediaStream>>>,
    pub(crate) events: EventEmitter<SessionEvent>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    /// Cancelled when the actor task has exited
    pub(crate) terminated: CancellationToken,
}

/// Handle to a session actor; cheap to clone
#[derive(Clone)]
pub struct PeerSession {
    shared: Arc<SessionShared>,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("local", &self.shared.local)
            .field("peer", &self.shared.peer)
            .field("polite", &self.shared.polite)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    /// Start a session actor; must be called inside a tokio runtime
    pub fn spawn(
        local: PeerId,
        peer: PeerId,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingLink>,
        options: SessionOptions,
    ) -> Result<Self> {
        let transport_events = transport.take_events().ok_or_else(|| {
            Error::InvalidState("transport is already driven by another session".to_string())
        })?;
        let polite = options.politeness.is_polite(&local, &peer);

        let shared = Arc::new(SessionShared {
            local,
            peer,
            polite,
            phase: RwLock::new(transport.signaling_state().into()),
            offering: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            local_tracks: RwLock::new(Vec::new()),
            remote_tracks: RwLock::new(Vec::new()),
            remote_streams: RwLock::new(Vec::new()),
            events: EventEmitter::new(),
            transport: Arc::clone(&transport),
            terminated: CancellationToken::new(),
        });

        let (inputs, receiver) = mpsc::unbounded_channel();
        let actor = SessionActor::new(
            Arc::clone(&shared),
            transport,
            signaling,
            receiver,
            inputs.downgrade(),
            transport_events,
            options,
        );
        tokio::spawn(
            actor
                .run()
                .instrument(logging::session_span(&shared.local, &shared.peer, polite)),
        );

        info!(
            local = %shared.local,
            peer = %shared.peer,
            polite,
            "Peer session started"
        );

        Ok(Self { shared, inputs })
    }

    #[must_use]
    pub fn local_name(&self) -> &PeerId {
        &self.shared.local
    }

    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.shared.peer
    }

    #[must_use]
    pub fn is_polite(&self) -> bool {
        self.shared.polite
    }

    #[must_use]
    pub fn phase(&self) -> NegotiationPhase {
        *self.shared.phase.read()
    }

    #[must_use]
    pub fn is_offering(&self) -> bool {
        self.shared.offering.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn events(&self) -> &EventEmitter<SessionEvent> {
        &self.shared.events
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.shared.transport
    }

    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.shared.transport.local_description()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.shared.transport.remote_description()
    }

    /// Tracks this side sends, including ones waiting to be attached
    #[must_use]
    pub fn local_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.shared
            .local_tracks
            .read()
            .iter()
            .map(|local| Arc::clone(&local.track))
            .collect()
    }

    /// Queue an inbound signaling message without waiting for it
    pub fn post_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        self.post(SessionInput::Signal {
            envelope,
            respond_to: None,
        })
    }

    /// Process an inbound signaling message and wait for the outcome
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(SessionInput::Signal {
            envelope,
            respond_to: Some(tx),
        })?;
        self.await_reply(rx).await
    }

    /// Swap outgoing tracks for silence (or restore them) without renegotiating
    pub async fn mute_media(&self, selector: MediaSelector, muted: bool) -> Result<()> {
        self.request(Command::Mute { selector, muted }).await
    }

    /// Replace the first matching outgoing track in place
    pub async fn replace_track(&self, selector: MediaSelector, track: Arc<MediaTrack>) -> Result<()> {
        self.request(Command::ReplaceTrack { selector, track }).await
    }

    /// Start an offer now, or once the current round completes
    pub async fn renegotiate(&self) -> Result<()> {
        self.request(Command::Renegotiate).await
    }

    /// Wait until every previously posted input has been processed
    pub async fn ping(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(SessionInput::Ping(tx))?;
        rx.await
            .map_err(|_| Error::Closed(format!("session with {}", self.shared.peer)))
    }

    /// Begin closing without waiting; repeated calls do nothing
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inputs.send(SessionInput::Command {
            command: Command::Close,
            respond_to: None,
        });
    }

    /// Close the session and wait for its task to finish
    pub async fn close(&self) {
        self.shutdown();
        self.shared.terminated.cancelled().await;
    }

    /// Resolves once the session task has exited
    pub async fn closed(&self) {
        self.shared.terminated.cancelled().await;
    }

    async fn request(&self, command: Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(SessionInput::Command {
            command,
            respond_to: Some(tx),
        })?;
        self.await_reply(rx).await
    }

    fn post(&self, input: SessionInput) -> Result<()> {
        self.inputs
            .send(input)
            .map_err(|_| Error::Closed(format!("session with {}", self.shared.peer)))
    }

    async fn await_reply(&self, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        rx.await
            .map_err(|_| Error::Closed(format!("session with {}", self.shared.peer)))?
    }
}

impl MediaConsumer for PeerSession {
    /// Queue media for sending; the id is ignored since tracks keep their own
    fn add_media(&self, media: Media, _id: Option<&str>) -> Result<()> {
        self.post(SessionInput::Command {
            command: Command::AddMedia(media),
            respond_to: None,
        })
    }

    fn remove_media(&self, selector: &MediaSelector) -> Result<()> {
        self.post(SessionInput::Command {
            command: Command::RemoveMedia(selector.clone()),
            respond_to: None,
        })
    }

    /// Live tracks received from the peer
    fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.shared.remote_tracks.read().clone()
    }

    /// Active streams received from the peer
    fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.shared
            .remote_streams
            .read()
            .iter()
            .filter(|stream| stream.is_active())
            .cloned()
            .collect()
    }
}
