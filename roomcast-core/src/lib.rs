//! Roomcast core
//!
//! Peer sessions with perfect negotiation, the session directory that follows
//! room membership, the topology selector and the shared plumbing they run
//! on: ids, errors, configuration, logging, events, signaling and the
//! transport seam.

pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod logging;
pub mod media;
pub mod session;
pub mod signaling;
pub mod topology;
pub mod transport;
pub mod types;

pub use config::Config;
pub use directory::{DirectoryEvent, SessionDirectory};
pub use error::{Error, Result};
pub use events::EventEmitter;
pub use media::{Media, MediaConsumer, MediaSelector, MediaStream, MediaTrack, TrackKind};
pub use session::{NegotiationPhase, PeerSession, Politeness, SessionEvent, SessionOptions};
pub use signaling::{SignalEnvelope, SignalingLink};
pub use topology::{Topology, TopologySelector};
pub use types::{PeerId, StreamId, TrackId};
