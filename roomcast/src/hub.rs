//! Server roles of a room
//!
//! Each hub joins the signaling channel under a reserved name and keeps one
//! polite session per participant in a [`SessionDirectory`]. [`SfuHub`]
//! forwards every stream it receives to the other participants; [`McuHub`]
//! composites everything it receives and sends the mix back to everyone.

use parking_lot::Mutex;
use roomcast_core::config::Config;
use roomcast_core::directory::{DirectoryEvent, SessionDirectory};
use roomcast_core::error::Result;
use roomcast_core::media::{Media, MediaConsumer, MediaSelector, MediaStream};
use roomcast_core::session::{Politeness, SessionEvent, SessionOptions};
use roomcast_core::signaling::hub::SignalingHub;
use roomcast_core::signaling::{kinds, SignalEnvelope, SignalingLink};
use roomcast_core::transport::TransportFactory;
use roomcast_core::types::{PeerId, StreamId};
use roomcast_mixer::{presets, ActivityDetector, AudioCompositor, VideoCompositor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::conference::{MCU_PEER, SFU_PEER};

/// Participants are impolite towards servers, so the server side yields
fn hub_directory(
    name: &str,
    config: &Config,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingLink>,
) -> Result<SessionDirectory> {
    let options =
        SessionOptions::from_config(&config.negotiation)?.with_politeness(Politeness::Polite);
    Ok(SessionDirectory::new(
        PeerId::from(name),
        factory,
        signaling,
        options,
    ))
}

/// Feed inbound messages to `directory` until the channel closes
fn pump(
    directory: SessionDirectory,
    mut rx: mpsc::UnboundedReceiver<SignalEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            // Hubs serve every topology
            if envelope.kind == kinds::ARCHITECTURE_SWITCH {
                continue;
            }
            let kind = envelope.kind.clone();
            if let Err(e) = directory.handle_message(envelope) {
                if e.is_closed() {
                    break;
                }
                warn!(hub = %directory.local_name(), kind = %kind, error = %e, "Failed to handle message");
            }
        }
        debug!(hub = %directory.local_name(), "Hub signaling channel closed");
    })
}

struct SfuInner {
    directory: SessionDirectory,
    /// Streams received from each participant
    published: Mutex<HashMap<PeerId, Vec<Arc<MediaStream>>>>,
}

/// Selective forwarding: every participant receives every other
/// participant's streams unchanged
#[derive(Clone)]
pub struct SfuHub {
    inner: Arc<SfuInner>,
}

impl std::fmt::Debug for SfuHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SfuHub")
            .field("peers", &self.inner.directory.peers())
            .field("published", &self.published().len())
            .finish()
    }
}

impl SfuHub {
    pub fn new(
        config: &Config,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingLink>,
    ) -> Result<Self> {
        let inner = Arc::new(SfuInner {
            directory: hub_directory(SFU_PEER, config, factory, signaling)?,
            published: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.directory.events().on(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        });

        info!(name = SFU_PEER, "Forwarding hub created");
        Ok(Self { inner })
    }

    /// Join `room` and start serving it
    pub fn join(
        room: &SignalingHub,
        config: &Config,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let (link, rx) = room.join(PeerId::from(SFU_PEER));
        let hub = Self::new(config, factory, Arc::new(link))?;
        hub.listen(rx);
        Ok(hub)
    }

    pub fn listen(&self, rx: mpsc::UnboundedReceiver<SignalEnvelope>) -> JoinHandle<()> {
        pump(self.inner.directory.clone(), rx)
    }

    #[must_use]
    pub fn directory(&self) -> &SessionDirectory {
        &self.inner.directory
    }

    /// Ids of the streams currently being forwarded, sorted
    #[must_use]
    pub fn published(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .inner
            .published
            .lock()
            .values()
            .flatten()
            .map(|stream| stream.id().clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn close(&self) {
        self.inner.published.lock().clear();
        self.inner.directory.close().await;
    }
}

impl SfuInner {
    fn on_event(&self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::UserConnected(peer) => self.replay(peer),
            DirectoryEvent::UserDisconnected(peer) => self.withdraw_all(peer),
            DirectoryEvent::Session { peer, event } => match event {
                SessionEvent::TrackAdded { streams, .. } => {
                    for stream in streams {
                        self.publish(peer, stream);
                    }
                }
                SessionEvent::TrackRemoved { track } => {
                    self.forward_removal(peer, &MediaSelector::Track(track.id().clone()));
                }
                SessionEvent::StreamRemoved(stream) => self.withdraw(peer, stream.id()),
                SessionEvent::Closed => self.withdraw_all(peer),
                _ => {}
            },
        }
    }

    /// Forward `stream` from `owner` to everyone else. A stream grows one
    /// track at a time, so it is forwarded again for every new track.
    fn publish(&self, owner: &PeerId, stream: &Arc<MediaStream>) {
        {
            let mut published = self.published.lock();
            let streams = published.entry(owner.clone()).or_default();
            if !streams.iter().any(|known| known.id() == stream.id()) {
                streams.push(Arc::clone(stream));
            }
        }

        for session in self.directory.sessions() {
            if session.peer() == owner {
                continue;
            }
            debug!(from = %owner, to = %session.peer(), stream = %stream.id(), "Forwarding stream");
            if let Err(e) = session.add_media(Media::Stream(Arc::clone(stream)), None) {
                debug!(peer = %session.peer(), error = %e, "Skipping closed session");
            }
        }
    }

    /// Send everything already published to a newcomer
    fn replay(&self, peer: &PeerId) {
        let Some(session) = self.directory.get(peer) else {
            return;
        };
        let streams: Vec<Arc<MediaStream>> = self
            .published
            .lock()
            .iter()
            .filter(|(owner, _)| *owner != peer)
            .flat_map(|(_, streams)| streams.iter().cloned())
            .collect();

        debug!(peer = %peer, streams = streams.len(), "Replaying published streams");
        for stream in streams {
            if let Err(e) = session.add_media(Media::Stream(stream), None) {
                debug!(peer = %peer, error = %e, "Skipping closed session");
                return;
            }
        }
    }

    fn withdraw(&self, owner: &PeerId, id: &StreamId) {
        if let Some(streams) = self.published.lock().get_mut(owner) {
            streams.retain(|stream| stream.id() != id);
        }
        self.forward_removal(owner, &MediaSelector::Stream(id.clone()));
    }

    fn withdraw_all(&self, owner: &PeerId) {
        let streams = self.published.lock().remove(owner).unwrap_or_default();
        for stream in streams {
            self.forward_removal(owner, &MediaSelector::Stream(stream.id().clone()));
        }
    }

    fn forward_removal(&self, owner: &PeerId, selector: &MediaSelector) {
        for session in self.directory.sessions() {
            if session.peer() == owner {
                continue;
            }
            if let Err(e) = session.remove_media(selector) {
                debug!(peer = %session.peer(), error = %e, "Skipping closed session");
            }
        }
    }
}

struct McuInner {
    directory: SessionDirectory,
    detector: Arc<ActivityDetector>,
    video: Arc<VideoCompositor>,
    audio: Arc<AudioCompositor>,
    output: Arc<MediaStream>,
    /// Compositor source ids contributed by each participant
    sources: Mutex<HashMap<PeerId, Vec<String>>>,
}

/// Mixing: every participant sends to the hub and receives one composite
/// stream back
#[derive(Clone)]
pub struct McuHub {
    inner: Arc<McuInner>,
}

impl std::fmt::Debug for McuHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McuHub")
            .field("peers", &self.inner.directory.peers())
            .field("sources", &self.inner.video.source_ids())
            .finish()
    }
}

impl McuHub {
    pub fn new(
        config: &Config,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingLink>,
    ) -> Result<Self> {
        let directory = hub_directory(MCU_PEER, config, factory, signaling)?;
        let detector = Arc::new(ActivityDetector::new(&config.activity));
        let video = Arc::new(VideoCompositor::new(&config.video)?);
        video.add_config("speaker", presets::speaker(Arc::clone(&detector), 0.0))?;
        let audio = Arc::new(AudioCompositor::new(&config.audio));
        let output = MediaStream::new(vec![video.output_track(), audio.output_track()]);

        // Replayed onto every participant's session as it is created
        directory.add_media(Media::Stream(Arc::clone(&output)), None)?;

        let inner = Arc::new(McuInner {
            directory,
            detector,
            video,
            audio,
            output,
            sources: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.directory.events().on(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        });

        info!(name = MCU_PEER, "Mixing hub created");
        Ok(Self { inner })
    }

    /// Join `room` and start serving it
    pub fn join(
        room: &SignalingHub,
        config: &Config,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let (link, rx) = room.join(PeerId::from(MCU_PEER));
        let hub = Self::new(config, factory, Arc::new(link))?;
        hub.listen(rx);
        Ok(hub)
    }

    pub fn listen(&self, rx: mpsc::UnboundedReceiver<SignalEnvelope>) -> JoinHandle<()> {
        pump(self.inner.directory.clone(), rx)
    }

    #[must_use]
    pub fn directory(&self) -> &SessionDirectory {
        &self.inner.directory
    }

    #[must_use]
    pub fn video(&self) -> &Arc<VideoCompositor> {
        &self.inner.video
    }

    #[must_use]
    pub fn audio(&self) -> &Arc<AudioCompositor> {
        &self.inner.audio
    }

    /// The composite stream sent to every participant
    #[must_use]
    pub fn output(&self) -> Arc<MediaStream> {
        Arc::clone(&self.inner.output)
    }

    /// Start sampling, rendering and mixing
    pub fn start(&self) {
        self.inner.detector.start();
        self.inner.video.start();
        self.inner.audio.start();
    }

    pub async fn close(&self) {
        self.inner.detector.stop();
        self.inner.video.stop();
        self.inner.audio.stop();
        self.inner.directory.close().await;
    }
}

impl McuInner {
    fn mixers(&self) -> [&dyn MediaConsumer; 3] {
        [
            &*self.video as &dyn MediaConsumer,
            &*self.audio,
            &*self.detector,
        ]
    }

    fn on_event(&self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::UserDisconnected(peer) => self.drop_sources(peer),
            DirectoryEvent::Session { peer, event } => match event {
                SessionEvent::TrackAdded { streams, .. } => {
                    for stream in streams {
                        self.mix_in(peer, stream);
                    }
                }
                SessionEvent::StreamRemoved(stream) => {
                    let id = stream.id().to_string();
                    if let Some(ids) = self.sources.lock().get_mut(peer) {
                        ids.retain(|known| *known != id);
                    }
                    self.remove_source(&id);
                }
                SessionEvent::Closed => self.drop_sources(peer),
                _ => {}
            },
            DirectoryEvent::UserConnected(_) => {}
        }
    }

    /// Re-adding a grown stream picks up its new track
    fn mix_in(&self, peer: &PeerId, stream: &Arc<MediaStream>) {
        let id = stream.id().to_string();
        {
            let mut sources = self.sources.lock();
            let ids = sources.entry(peer.clone()).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }
        for mixer in self.mixers() {
            if let Err(e) = mixer.add_media(Media::Stream(Arc::clone(stream)), Some(&id)) {
                warn!(peer = %peer, stream = %id, error = %e, "Failed to add stream to mix");
            }
        }
    }

    fn remove_source(&self, id: &str) {
        let selector = MediaSelector::Source(id.to_string());
        for mixer in self.mixers() {
            if let Err(e) = mixer.remove_media(&selector) {
                warn!(stream = %id, error = %e, "Failed to remove stream from mix");
            }
        }
    }

    fn drop_sources(&self, peer: &PeerId) {
        let ids = self.sources.lock().remove(peer).unwrap_or_default();
        for id in ids {
            self.remove_source(&id);
        }
    }
}
