//! Session directory
//!
//! Keeps one [`PeerSession`] per remote participant, driven by the membership
//! messages of the signaling channel. Local media added to the directory is
//! replayed onto every session, present and future, and every session event
//! is re-emitted as [`DirectoryEvent::Session`] with the peer attached.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::EventEmitter;
use crate::media::{Media, MediaConsumer, MediaSelector, MediaStream, MediaTrack};
use crate::session::{PeerSession, SessionEvent, SessionOptions};
use crate::signaling::{Signal, SignalEnvelope, SignalingLink};
use crate::transport::TransportFactory;
use crate::types::PeerId;

#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    UserConnected(PeerId),
    UserDisconnected(PeerId),
    /// An event raised by the session with `peer`
    Session { peer: PeerId, event: SessionEvent },
}

struct DirectoryInner {
    local: PeerId,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingLink>,
    options: SessionOptions,
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
    local_media: RwLock<Vec<Media>>,
    events: EventEmitter<DirectoryEvent>,
    closed: AtomicBool,
}

/// Cheap to clone; clones share the same sessions
#[derive(Clone)]
pub struct SessionDirectory {
    inner: Arc<DirectoryInner>,
}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("local", &self.inner.local)
            .field("peers", &self.peers())
            .finish_non_exhaustive()
    }
}

impl SessionDirectory {
    pub fn new(
        local: PeerId,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingLink>,
        options: SessionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                local,
                factory,
                signaling,
                options,
                sessions: Mutex::new(HashMap::new()),
                local_media: RwLock::new(Vec::new()),
                events: EventEmitter::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn local_name(&self) -> &PeerId {
        &self.inner.local
    }

    #[must_use]
    pub fn events(&self) -> &EventEmitter<DirectoryEvent> {
        &self.inner.events
    }

    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<PeerSession> {
        self.inner.sessions.lock().get(peer).cloned()
    }

    /// Peers with a session, sorted
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.sessions.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<PeerSession> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    /// Dispatch one inbound message: membership messages reshape the
    /// directory, everything else goes to the sender's session
    pub fn handle_message(&self, envelope: SignalEnvelope) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(format!("directory of {}", self.inner.local)));
        }

        match envelope.signal()? {
            Signal::UserConnected(peer) => self.connect(peer),
            Signal::UserList(peers) => self.reconcile(peers),
            Signal::UserDisconnected(peer) => {
                self.disconnect(&peer);
                Ok(())
            }
            _ => {
                self.route(envelope);
                Ok(())
            }
        }
    }

    fn route(&self, envelope: SignalEnvelope) {
        let Some(sender) = envelope.sender.clone() else {
            debug!(kind = %envelope.kind, "Dropping message without sender");
            return;
        };
        match self.get(&sender) {
            Some(session) => {
                if let Err(err) = session.post_signal(envelope) {
                    debug!(peer = %sender, error = %err, "Session no longer accepts messages");
                }
            }
            None => warn!(peer = %sender, kind = %envelope.kind, "Message from unknown peer"),
        }
    }

    fn accepts(&self, peer: &PeerId) -> bool {
        *peer != self.inner.local && !peer.is_server()
    }

    fn connect(&self, peer: PeerId) -> Result<()> {
        if !self.accepts(&peer) {
            return Ok(());
        }
        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.contains_key(&peer) {
                debug!(peer = %peer, "Session already exists");
                return Ok(());
            }
            let session = self.create_session(&peer)?;
            sessions.insert(peer.clone(), session);
        }
        self.inner.events.emit(DirectoryEvent::UserConnected(peer));
        Ok(())
    }

    /// Make the session set match the roster in one step
    fn reconcile(&self, roster: Vec<PeerId>) -> Result<()> {
        let wanted: HashSet<PeerId> = roster.into_iter().filter(|p| self.accepts(p)).collect();
        let mut connected = Vec::new();
        let mut disconnected = Vec::new();
        let mut failure = None;

        {
            let mut sessions = self.inner.sessions.lock();

            let stale: Vec<PeerId> = sessions
                .keys()
                .filter(|peer| !wanted.contains(*peer))
                .cloned()
                .collect();
            for peer in stale {
                if let Some(session) = sessions.remove(&peer) {
                    session.shutdown();
                }
                disconnected.push(peer);
            }

            let mut fresh: Vec<&PeerId> = wanted.iter().filter(|p| !sessions.contains_key(*p)).collect();
            fresh.sort();
            for peer in fresh {
                match self.create_session(peer) {
                    Ok(session) => {
                        sessions.insert(peer.clone(), session);
                        connected.push(peer.clone());
                    }
                    Err(err) => {
                        warn!(peer = %peer, error = %err, "Failed to create session");
                        failure.get_or_insert(err);
                    }
                }
            }
        }

        info!(
            added = connected.len(),
            removed = disconnected.len(),
            "Reconciled user list"
        );
        for peer in disconnected {
            self.inner.events.emit(DirectoryEvent::UserDisconnected(peer));
        }
        for peer in connected {
            self.inner.events.emit(DirectoryEvent::UserConnected(peer));
        }

        failure.map_or(Ok(()), Err)
    }

    fn disconnect(&self, peer: &PeerId) {
        let removed = self.inner.sessions.lock().remove(peer);
        match removed {
            Some(session) => {
                session.shutdown();
                self.inner
                    .events
                    .emit(DirectoryEvent::UserDisconnected(peer.clone()));
            }
            None => warn!(peer = %peer, "Disconnect for unknown peer"),
        }
    }

    /// Spawn a session, hook its events and replay local media onto it.
    /// Called with the session map locked.
    fn create_session(&self, peer: &PeerId) -> Result<PeerSession> {
        let transport = self.inner.factory.create(&self.inner.local, peer)?;
        let session = PeerSession::spawn(
            self.inner.local.clone(),
            peer.clone(),
            transport,
            Arc::clone(&self.inner.signaling),
            self.inner.options.clone(),
        )?;

        let directory = Arc::downgrade(&self.inner);
        let origin = peer.clone();
        session
            .events()
            .on(move |event| forward(&directory, &origin, event));

        for media in self.inner.local_media.read().iter() {
            session.add_media(media.clone(), None)?;
        }

        debug!(peer = %peer, "Created session");
        Ok(session)
    }

    /// Set outgoing tracks matching `selector` muted or live on every session
    pub async fn mute_media(&self, selector: MediaSelector, muted: bool) -> Result<()> {
        let sessions = self.sessions();
        let results = join_all(
            sessions
                .iter()
                .map(|session| session.mute_media(selector.clone(), muted)),
        )
        .await;
        results.into_iter().try_for_each(ignore_closed)
    }

    /// Replace a local track everywhere it is sent
    pub async fn replace_track(&self, selector: MediaSelector, track: Arc<MediaTrack>) -> Result<()> {
        {
            let mut media = self.inner.local_media.write();
            if let Some(entry) = media.iter_mut().find(|m| match m {
                Media::Track(existing) => selector.matches_track(existing, &[]),
                Media::Stream(_) => false,
            }) {
                *entry = Media::Track(Arc::clone(&track));
            }
        }

        let sessions = self.sessions();
        let results = join_all(
            sessions
                .iter()
                .map(|session| session.replace_track(selector.clone(), Arc::clone(&track))),
        )
        .await;
        results.into_iter().try_for_each(|result| match result {
            Err(Error::NotFound(_)) => Ok(()),
            other => ignore_closed(other),
        })
    }

    /// Close every session; later calls do nothing
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions: Vec<PeerSession> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        info!(local = %self.inner.local, sessions = sessions.len(), "Closing session directory");
        join_all(sessions.iter().map(|session| session.close())).await;
    }

    /// True once closed, or when any managed session has closed
    #[must_use]
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
            || self
                .inner
                .sessions
                .lock()
                .values()
                .any(PeerSession::is_closed)
    }
}

fn forward(directory: &Weak<DirectoryInner>, peer: &PeerId, event: &SessionEvent) {
    let Some(inner) = directory.upgrade() else {
        return;
    };

    if matches!(event, SessionEvent::Closed) {
        let mut sessions = inner.sessions.lock();
        // A replacement session for the same peer stays
        if sessions.get(peer).is_some_and(PeerSession::is_closed) {
            sessions.remove(peer);
        }
    }

    inner.events.emit(DirectoryEvent::Session {
        peer: peer.clone(),
        event: event.clone(),
    });
}

fn ignore_closed(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_closed() => Ok(()),
        other => other,
    }
}

impl MediaConsumer for SessionDirectory {
    /// Send `media` to every current and future peer
    fn add_media(&self, media: Media, _id: Option<&str>) -> Result<()> {
        self.inner.local_media.write().push(media.clone());
        for session in self.sessions() {
            if let Err(err) = session.add_media(media.clone(), None) {
                debug!(peer = %session.peer(), error = %err, "Skipping closed session");
            }
        }
        Ok(())
    }

    fn remove_media(&self, selector: &MediaSelector) -> Result<()> {
        self.inner.local_media.write().retain(|media| {
            let id = media.id();
            !selector.matches_media(media, &id)
        });
        for session in self.sessions() {
            if let Err(err) = session.remove_media(selector) {
                debug!(peer = %session.peer(), error = %err, "Skipping closed session");
            }
        }
        Ok(())
    }

    /// Tracks received from every peer
    fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.sessions()
            .iter()
            .flat_map(MediaConsumer::tracks)
            .collect()
    }

    fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.sessions()
            .iter()
            .flat_map(MediaConsumer::streams)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::signaling::{kinds, ChannelLink};
    use crate::transport::memory::MemoryTransportFactory;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn directory(local: &str) -> (SessionDirectory, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (link, rx) = ChannelLink::new();
        let directory = SessionDirectory::new(
            PeerId::from(local),
            Arc::new(MemoryTransportFactory::new()),
            Arc::new(link),
            SessionOptions::default(),
        );
        (directory, rx)
    }

    fn user_list(peers: &[&str]) -> SignalEnvelope {
        SignalEnvelope::new(kinds::USER_LIST, None, json!(peers))
    }

    fn membership(kind: &str, peer: &str) -> SignalEnvelope {
        SignalEnvelope::new(kind, None, json!(peer))
    }

    #[tokio::test]
    async fn test_user_list_reconciles_sessions() {
        let (directory, _rx) = directory("me");
        let mut events = directory.events().subscribe();

        directory.handle_message(user_list(&["b", "c"])).unwrap();
        let c = directory.get(&PeerId::from("c")).unwrap();
        let camera = MediaTrack::new(TrackKind::Video);
        directory.add_media(Media::Track(Arc::clone(&camera)), None).unwrap();

        directory.handle_message(user_list(&["a", "b", "me"])).unwrap();

        assert_eq!(directory.peers(), vec![PeerId::from("a"), PeerId::from("b")]);
        c.closed().await;
        assert!(c.is_closed());

        let a = directory.get(&PeerId::from("a")).unwrap();
        a.ping().await.unwrap();
        let sent: Vec<_> = a.local_tracks().iter().map(|t| t.id().clone()).collect();
        assert_eq!(sent, vec![camera.id().clone()]);

        let mut membership = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                DirectoryEvent::UserConnected(peer) => membership.push(format!("+{peer}")),
                DirectoryEvent::UserDisconnected(peer) => membership.push(format!("-{peer}")),
                DirectoryEvent::Session { .. } => {}
            }
        }
        assert_eq!(membership, vec!["+b", "+c", "-c", "+a"]);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (directory, _rx) = directory("me");

        directory.handle_message(membership(kinds::USER_CONNECTED, "bob")).unwrap();
        directory.handle_message(membership(kinds::USER_CONNECTED, "bob")).unwrap();
        directory.handle_message(membership(kinds::USER_CONNECTED, "me")).unwrap();
        directory.handle_message(membership(kinds::USER_CONNECTED, "@sfu")).unwrap();
        assert_eq!(directory.peers(), vec![PeerId::from("bob")]);

        let bob = directory.get(&PeerId::from("bob")).unwrap();
        directory.handle_message(membership(kinds::USER_DISCONNECTED, "bob")).unwrap();
        directory.handle_message(membership(kinds::USER_DISCONNECTED, "bob")).unwrap();
        assert!(directory.peers().is_empty());
        bob.closed().await;
    }

    #[tokio::test]
    async fn test_session_events_carry_peer_and_closed_session_is_dropped() {
        let (directory, _rx) = directory("me");
        let mut events = directory.events().subscribe();
        directory.handle_message(membership(kinds::USER_CONNECTED, "bob")).unwrap();

        directory
            .handle_message(
                SignalEnvelope::connection_close(&PeerId::from("me"))
                    .from_sender(PeerId::from("bob")),
            )
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                DirectoryEvent::Session {
                    peer,
                    event: SessionEvent::Closed,
                } => {
                    assert_eq!(peer, PeerId::from("bob"));
                    break;
                }
                _ => continue,
            }
        }
        assert!(directory.peers().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (directory, mut rx) = directory("me");
        directory.handle_message(user_list(&["a", "b"])).unwrap();

        directory.close().await;
        let closes = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|envelope| envelope.kind == kinds::CONNECTION_CLOSE)
            .count();
        assert_eq!(closes, 2);

        directory.close().await;
        assert!(rx.try_recv().is_err());
        assert!(directory.closed());
        assert!(directory.handle_message(user_list(&["a"])).is_err());
    }
}
