//! One participant's view of a room
//!
//! A [`Conference`] keeps a handler per topology: a [`SessionDirectory`] for
//! the mesh and one [`PeerSession`] each towards the forwarding and mixing
//! servers. Local media goes to the handler of the active topology; media
//! received through it is composited locally, except under `mcu` where the
//! server already sends a mixed stream.

use futures::join;
use parking_lot::RwLock;
use roomcast_core::config::Config;
use roomcast_core::directory::{DirectoryEvent, SessionDirectory};
use roomcast_core::error::Result;
use roomcast_core::events::EventEmitter;
use roomcast_core::media::{Media, MediaConsumer, MediaSelector, MediaStream};
use roomcast_core::session::{PeerSession, Politeness, SessionEvent, SessionOptions};
use roomcast_core::signaling::{Signal, SignalEnvelope, SignalingLink, SERVER};
use roomcast_core::topology::{Topology, TopologySelector, TopologySwitched};
use roomcast_core::transport::TransportFactory;
use roomcast_core::types::PeerId;
use roomcast_mixer::{presets, ActivityDetector, AudioCompositor, VideoCompositor};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Peer name of the selective forwarding server
pub const SFU_PEER: &str = "@sfu";
/// Peer name of the mixing server
pub const MCU_PEER: &str = "@mcu";

struct Inner {
    name: PeerId,
    signaling: Arc<dyn SignalingLink>,
    selector: TopologySelector,
    mesh: SessionDirectory,
    sfu: PeerSession,
    mcu: PeerSession,
    detector: Arc<ActivityDetector>,
    video: Arc<VideoCompositor>,
    audio: Arc<AudioCompositor>,
    mixed: Arc<MediaStream>,
    local: RwLock<Vec<Media>>,
}

#[derive(Clone)]
pub struct Conference {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Conference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conference")
            .field("name", &self.inner.name)
            .field("topology", &self.inner.selector.current())
            .field("peers", &self.inner.mesh.peers())
            .finish_non_exhaustive()
    }
}

impl Conference {
    /// Set up every handler; must be called inside a tokio runtime
    pub fn new(
        name: PeerId,
        config: &Config,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingLink>,
    ) -> Result<Self> {
        let options = SessionOptions::from_config(&config.negotiation)?;
        let initial: Topology = config.topology.initial.parse()?;

        let mesh = SessionDirectory::new(
            name.clone(),
            Arc::clone(&factory),
            Arc::clone(&signaling),
            options.clone(),
        );
        let server_options = options.with_politeness(Politeness::Impolite);
        let server_session = |peer: &str| -> Result<PeerSession> {
            let peer = PeerId::from(peer);
            let transport = factory.create(&name, &peer)?;
            PeerSession::spawn(
                name.clone(),
                peer,
                transport,
                Arc::clone(&signaling),
                server_options.clone(),
            )
        };
        let sfu = server_session(SFU_PEER)?;
        let mcu = server_session(MCU_PEER)?;

        let detector = Arc::new(ActivityDetector::new(&config.activity));
        let video = Arc::new(VideoCompositor::new(&config.video)?);
        video.add_config("speaker", presets::speaker(Arc::clone(&detector), 0.0))?;
        let audio = Arc::new(AudioCompositor::new(&config.audio));
        let mixed = MediaStream::new(vec![video.output_track(), audio.output_track()]);

        let inner = Arc::new(Inner {
            name,
            signaling,
            selector: TopologySelector::new(initial),
            mesh,
            sfu,
            mcu,
            detector,
            video,
            audio,
            mixed,
            local: RwLock::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.mesh.events().on(move |event| {
            if let (Some(inner), DirectoryEvent::Session { event, .. }) = (weak.upgrade(), event) {
                inner.on_remote(Topology::Mesh, event);
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.sfu.events().on(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_remote(Topology::Sfu, event);
            }
        });

        info!(name = %inner.name, topology = %initial, "Conference created");
        Ok(Self { inner })
    }

    #[must_use]
    pub fn name(&self) -> &PeerId {
        &self.inner.name
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        self.inner.selector.current()
    }

    /// Raised when the room moves to another topology, once local media
    /// has been handed to the new handler
    #[must_use]
    pub fn topology_events(&self) -> &EventEmitter<TopologySwitched> {
        self.inner.selector.events()
    }

    #[must_use]
    pub fn mesh(&self) -> &SessionDirectory {
        &self.inner.mesh
    }

    #[must_use]
    pub fn sfu(&self) -> &PeerSession {
        &self.inner.sfu
    }

    #[must_use]
    pub fn mcu(&self) -> &PeerSession {
        &self.inner.mcu
    }

    #[must_use]
    pub fn video(&self) -> &Arc<VideoCompositor> {
        &self.inner.video
    }

    #[must_use]
    pub fn audio(&self) -> &Arc<AudioCompositor> {
        &self.inner.audio
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<ActivityDetector> {
        &self.inner.detector
    }

    /// What this participant should display: the server mix under `mcu`,
    /// the local composition otherwise
    #[must_use]
    pub fn output(&self) -> Option<Arc<MediaStream>> {
        match self.topology() {
            Topology::Mcu => self.inner.mcu.streams().into_iter().next(),
            Topology::Mesh | Topology::Sfu => Some(Arc::clone(&self.inner.mixed)),
        }
    }

    /// Start sampling, rendering and mixing
    pub fn start(&self) {
        self.inner.detector.start();
        self.inner.video.start();
        self.inner.audio.start();
    }

    /// Send local media through the active topology, now and after switches
    pub fn add_local_media(&self, media: Media) -> Result<()> {
        self.inner.local.write().push(media.clone());
        self.inner.handler(self.topology()).add_media(media, None)
    }

    pub fn remove_local_media(&self, selector: &MediaSelector) -> Result<()> {
        self.inner
            .local
            .write()
            .retain(|media| !selector.matches_media(media, &media.id()));
        self.inner.handler(self.topology()).remove_media(selector)
    }

    /// Ask the signaling server to move the whole room to `name`
    pub fn request_topology(&self, name: &str) -> Result<()> {
        let topology: Topology = name.parse()?;
        self.inner.signaling.send(SignalEnvelope::topology_switch(
            Some(PeerId::from(SERVER)),
            Some(topology.as_str()),
        ))
    }

    /// Dispatch one inbound signaling message
    pub fn handle_message(&self, envelope: SignalEnvelope) -> Result<()> {
        if let Signal::TopologySwitch(name) = envelope.signal()? {
            return match name {
                Some(name) => self.inner.switch_to(name.parse()?),
                None => Ok(()),
            };
        }
        match envelope.sender.as_ref().map(PeerId::as_str) {
            Some(SFU_PEER) => self.inner.sfu.post_signal(envelope),
            Some(MCU_PEER) => self.inner.mcu.post_signal(envelope),
            _ => self.inner.mesh.handle_message(envelope),
        }
    }

    /// Feed inbound messages from `rx` until it closes
    pub fn listen(&self, mut rx: mpsc::UnboundedReceiver<SignalEnvelope>) -> JoinHandle<()> {
        let conference = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let kind = envelope.kind.clone();
                if let Err(e) = conference.handle_message(envelope) {
                    warn!(name = %conference.inner.name, kind = %kind, error = %e, "Failed to handle message");
                }
            }
            debug!(name = %conference.inner.name, "Signaling channel closed");
        })
    }

    /// Stop the local pipelines and close every handler
    pub async fn close(&self) {
        self.inner.detector.stop();
        self.inner.video.stop();
        self.inner.audio.stop();
        join!(
            self.inner.mesh.close(),
            self.inner.sfu.close(),
            self.inner.mcu.close()
        );
        info!(name = %self.inner.name, "Conference closed");
    }

    /// True once any handler has closed
    #[must_use]
    pub fn closed(&self) -> bool {
        self.inner.mesh.closed() || self.inner.sfu.is_closed() || self.inner.mcu.is_closed()
    }
}

impl Inner {
    fn handler(&self, topology: Topology) -> &dyn MediaConsumer {
        match topology {
            Topology::Mesh => &self.mesh,
            Topology::Sfu => &self.sfu,
            Topology::Mcu => &self.mcu,
        }
    }

    fn mixers(&self) -> [&dyn MediaConsumer; 3] {
        [
            &*self.video as &dyn MediaConsumer,
            &*self.audio,
            &*self.detector,
        ]
    }

    fn on_remote(&self, source: Topology, event: &SessionEvent) {
        if self.selector.current() != source {
            return;
        }
        match event {
            // Remote streams fill up one track at a time; re-adding picks up the new one
            SessionEvent::TrackAdded { streams, .. } => {
                for stream in streams {
                    self.mix_in(stream);
                }
            }
            SessionEvent::StreamRemoved(stream) => {
                let selector = MediaSelector::Source(stream.id().to_string());
                for mixer in self.mixers() {
                    if let Err(e) = mixer.remove_media(&selector) {
                        warn!(stream = %stream.id(), error = %e, "Failed to remove stream from mix");
                    }
                }
            }
            _ => {}
        }
    }

    fn mix_in(&self, stream: &Arc<MediaStream>) {
        let id = stream.id().to_string();
        for mixer in self.mixers() {
            if let Err(e) = mixer.add_media(Media::Stream(Arc::clone(stream)), Some(&id)) {
                warn!(stream = %id, error = %e, "Failed to add stream to mix");
            }
        }
    }

    fn clear_mix(&self) {
        for mixer in self.mixers() {
            if let Err(e) = mixer.remove_media(&MediaSelector::All) {
                warn!(error = %e, "Failed to clear mix");
            }
        }
    }

    /// Mix in everything `topology` currently receives
    fn fill_mix(&self, topology: Topology) {
        let streams = match topology {
            Topology::Mesh => self.mesh.streams(),
            Topology::Sfu => self.sfu.streams(),
            Topology::Mcu => Vec::new(),
        };
        for stream in &streams {
            self.mix_in(stream);
        }
    }

    #[instrument(skip_all, fields(name = %self.name, target = %target))]
    fn switch_to(&self, target: Topology) -> Result<()> {
        let previous = self.selector.current();
        if target == previous {
            debug!("Already on requested topology");
            return Ok(());
        }

        let local = self.local.read().clone();
        for media in local {
            self.handler(target).add_media(media, None)?;
        }

        // Remote events for `target` are accepted from here on, so nothing
        // that arrives while the mix is refilled gets dropped
        self.clear_mix();
        self.selector.set_topology(target);
        self.fill_mix(target);
        self.handler(previous).remove_media(&MediaSelector::All)?;

        info!(%previous, "Switched topology");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_core::media::{MediaTrack, TrackKind};
    use roomcast_core::signaling::ChannelLink;
    use roomcast_core::topology::SwitchCause;
    use roomcast_core::transport::memory::MemoryTransportFactory;

    fn conference() -> (Conference, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (link, rx) = ChannelLink::new();
        let conference = Conference::new(
            PeerId::from("me"),
            &Config::default(),
            Arc::new(MemoryTransportFactory::new()),
            Arc::new(link),
        )
        .unwrap();
        (conference, rx)
    }

    fn switch(topology: &str) -> SignalEnvelope {
        SignalEnvelope::topology_switch(None, Some(topology)).from_sender(PeerId::from(SERVER))
    }

    #[tokio::test]
    async fn test_request_topology_asks_the_server() {
        let (conference, mut rx) = conference();
        assert!(conference.request_topology("ring").is_err());
        conference.request_topology("sfu").unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.receiver, Some(PeerId::from(SERVER)));
        assert_eq!(
            sent.signal().unwrap(),
            Signal::TopologySwitch(Some("sfu".to_string()))
        );
        assert_eq!(conference.topology(), Topology::Mesh);
    }

    #[tokio::test]
    async fn test_switch_moves_local_media_and_notifies() {
        let (conference, _rx) = conference();
        let mut switches = conference.topology_events().subscribe();
        let camera = MediaTrack::new(TrackKind::Video);
        conference
            .add_local_media(Media::Stream(MediaStream::new(vec![camera])))
            .unwrap();

        conference.handle_message(switch("mesh")).unwrap();
        assert!(switches.try_recv().is_err());

        conference.handle_message(switch("sfu")).unwrap();
        assert_eq!(conference.topology(), Topology::Sfu);
        assert_eq!(
            switches.try_recv().unwrap(),
            TopologySwitched {
                current: Topology::Sfu,
                previous: Topology::Mesh,
                cause: SwitchCause::Set,
            }
        );

        conference.sfu().ping().await.unwrap();
        assert_eq!(conference.sfu().local_tracks().len(), 1);

        let query = SignalEnvelope::topology_switch(None, None).from_sender(PeerId::from(SERVER));
        conference.handle_message(query).unwrap();
        assert_eq!(conference.topology(), Topology::Sfu);
        assert!(conference.handle_message(switch("ring")).is_err());
    }

    #[tokio::test]
    async fn test_remote_media_arriving_during_switch_is_mixed() {
        let (conference, _rx) = conference();
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video)]);
        let id = stream.id().to_string();

        // Deliver an sfu track from inside the switch, as a session task would
        let weak = Arc::downgrade(&conference.inner);
        let arriving = Arc::clone(&stream);
        conference.topology_events().on(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.on_remote(
                    Topology::Sfu,
                    &SessionEvent::TrackAdded {
                        track: arriving.tracks()[0].clone(),
                        streams: vec![Arc::clone(&arriving)],
                    },
                );
            }
        });

        conference.handle_message(switch("sfu")).unwrap();
        assert_eq!(conference.video().source_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_output_follows_topology() {
        let (conference, _rx) = conference();
        let mixed = conference.output().unwrap();
        assert_eq!(mixed.tracks().len(), 2);

        conference.handle_message(switch("mcu")).unwrap();
        assert!(conference.output().is_none());
    }

    #[tokio::test]
    async fn test_close_closes_every_handler() {
        let (conference, _rx) = conference();
        assert!(!conference.closed());
        conference.close().await;
        assert!(conference.closed());
        assert!(conference.sfu().is_closed());
        assert!(conference.mcu().is_closed());
    }
}
