use std::sync::Arc;
use std::time::Duration;

use roomcast_core::media::{Media, MediaConsumer, MediaSelector, MediaTrack, TrackKind};
use roomcast_core::session::{NegotiationPhase, PeerSession, SessionEvent, SessionOptions};
use roomcast_core::signaling::{kinds, ChannelLink, SdpType, Signal, SignalEnvelope};
use roomcast_core::transport::memory::MemoryTransport;
use roomcast_core::transport::{IceConnectionState, PeerTransport, TransceiverDirection};
use roomcast_core::types::PeerId;
use tokio::sync::mpsc;

struct Endpoint {
    session: PeerSession,
    transport: Arc<MemoryTransport>,
    outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    sent: Vec<SignalEnvelope>,
}

impl Endpoint {
    fn spawn(local: &str, peer: &str, options: SessionOptions) -> Self {
        let transport = MemoryTransport::new();
        let (link, outbound) = ChannelLink::new();
        let session = PeerSession::spawn(
            PeerId::from(local),
            PeerId::from(peer),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            Arc::new(link),
            options,
        )
        .unwrap();
        Self {
            session,
            transport,
            outbound,
            sent: Vec::new(),
        }
    }

    /// Everything sent since the last call
    fn take_outbound(&mut self) -> Vec<SignalEnvelope> {
        let mut batch = Vec::new();
        while let Ok(envelope) = self.outbound.try_recv() {
            self.sent.push(envelope.clone());
            batch.push(envelope);
        }
        batch
    }

    fn answers_sent(&self) -> usize {
        self.sent
            .iter()
            .filter(|envelope| {
                matches!(envelope.signal(), Ok(Signal::Sdp(d)) if d.sdp_type == SdpType::Answer)
            })
            .count()
    }
}

async fn deliver(to: &PeerSession, from: &PeerSession, batch: Vec<SignalEnvelope>) {
    for envelope in batch {
        let _ = to
            .handle_signal(envelope.from_sender(from.local_name().clone()))
            .await;
    }
}

/// Exchange messages until neither side has anything left to say
async fn settle(a: &mut Endpoint, b: &mut Endpoint) {
    loop {
        a.session.ping().await.unwrap();
        b.session.ping().await.unwrap();
        let from_a = a.take_outbound();
        let from_b = b.take_outbound();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        deliver(&b.session, &a.session, from_a).await;
        deliver(&a.session, &b.session, from_b).await;
    }
}

fn pair() -> (Endpoint, Endpoint) {
    // "bob" sorts after "alice", so bob is the polite side
    (
        Endpoint::spawn("alice", "bob", SessionOptions::default()),
        Endpoint::spawn("bob", "alice", SessionOptions::default()),
    )
}

fn sdp_of(batch: &[SignalEnvelope], sdp_type: SdpType) -> usize {
    batch
        .iter()
        .filter(|envelope| matches!(envelope.signal(), Ok(Signal::Sdp(d)) if d.sdp_type == sdp_type))
        .count()
}

#[tokio::test]
async fn glare_resolves_in_favour_of_impolite_offer() {
    let (mut alice, mut bob) = pair();
    assert!(!alice.session.is_polite());
    assert!(bob.session.is_polite());

    alice.session.renegotiate().await.unwrap();
    bob.session.renegotiate().await.unwrap();
    assert_eq!(alice.session.phase(), NegotiationPhase::HaveLocalOffer);
    assert_eq!(bob.session.phase(), NegotiationPhase::HaveLocalOffer);

    settle(&mut alice, &mut bob).await;

    assert_eq!(alice.session.phase(), NegotiationPhase::Stable);
    assert_eq!(bob.session.phase(), NegotiationPhase::Stable);
    assert_eq!(alice.answers_sent(), 0);
    assert_eq!(bob.answers_sent(), 1);

    let effective = alice.session.local_description().unwrap();
    assert_eq!(effective.sdp_type, SdpType::Offer);
    assert_eq!(bob.session.remote_description().unwrap().sdp, effective.sdp);

    // Candidates from both sides made it through
    assert_eq!(alice.transport.ice_connection_state(), IceConnectionState::Connected);
    assert_eq!(bob.transport.ice_connection_state(), IceConnectionState::Connected);
}

#[tokio::test]
async fn renegotiation_while_offering_is_coalesced() {
    let (mut alice, mut bob) = pair();

    alice.session.renegotiate().await.unwrap();
    alice.session.renegotiate().await.unwrap();
    alice.session.renegotiate().await.unwrap();
    let first = alice.take_outbound();
    assert_eq!(sdp_of(&first, SdpType::Offer), 1);

    deliver(&bob.session, &alice.session, first).await;
    bob.session.ping().await.unwrap();
    let answer = bob.take_outbound();
    deliver(&alice.session, &bob.session, answer).await;

    // The coalesced trigger runs once the round is stable again
    alice.session.ping().await.unwrap();
    let second = alice.take_outbound();
    assert_eq!(sdp_of(&second, SdpType::Offer), 1);
    assert_eq!(alice.session.phase(), NegotiationPhase::HaveLocalOffer);

    deliver(&bob.session, &alice.session, second).await;
    settle(&mut alice, &mut bob).await;
    assert_eq!(alice.session.phase(), NegotiationPhase::Stable);
}

#[tokio::test]
async fn track_added_mid_round_is_attached_once_stable() {
    let (mut alice, mut bob) = pair();
    let mut bob_events = bob.session.events().subscribe();

    alice.session.renegotiate().await.unwrap();
    let camera = MediaTrack::new(TrackKind::Video);
    alice
        .session
        .add_media(Media::Track(Arc::clone(&camera)), None)
        .unwrap();
    alice.session.ping().await.unwrap();
    assert!(alice.transport.transceivers().is_empty());
    assert_eq!(alice.session.local_tracks().len(), 1);

    settle(&mut alice, &mut bob).await;

    let transceivers = alice.transport.transceivers();
    assert_eq!(transceivers.len(), 1);
    assert_eq!(transceivers[0].direction, TransceiverDirection::SendOnly);

    let received = bob.session.tracks();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id(), camera.id());

    let mut saw_track = false;
    while let Ok(event) = bob_events.try_recv() {
        if let SessionEvent::TrackAdded { track, streams } = event {
            assert_eq!(track.id(), camera.id());
            assert_eq!(streams.len(), 1);
            saw_track = true;
        }
    }
    assert!(saw_track);
}

#[tokio::test(start_paused = true)]
async fn early_candidates_are_applied_once_offer_arrives() {
    let (mut alice, bob) = pair();

    alice.session.renegotiate().await.unwrap();
    alice.session.ping().await.unwrap();
    let (candidates, offer): (Vec<_>, Vec<_>) = alice
        .take_outbound()
        .into_iter()
        .partition(|envelope| envelope.kind == kinds::ICE);
    assert_eq!(candidates.len(), 1);

    deliver(&bob.session, &alice.session, candidates).await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(bob.transport.remote_candidates().is_empty());

    deliver(&bob.session, &alice.session, offer).await;
    assert_eq!(bob.transport.remote_candidates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn early_candidates_are_dropped_after_retries() {
    let mut alice = Endpoint::spawn("alice", "bob", SessionOptions::default());
    let options = SessionOptions {
        ice_retry_attempts: 3,
        ..SessionOptions::default()
    };
    let bob = Endpoint::spawn("bob", "alice", options);

    alice.session.renegotiate().await.unwrap();
    alice.session.ping().await.unwrap();
    let (candidates, offer): (Vec<_>, Vec<_>) = alice
        .take_outbound()
        .into_iter()
        .partition(|envelope| envelope.kind == kinds::ICE);

    deliver(&bob.session, &alice.session, candidates).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    deliver(&bob.session, &alice.session, offer).await;
    assert!(bob.transport.remote_candidates().is_empty());
}

#[tokio::test]
async fn ice_disconnect_closes_without_notifying_peer() {
    let (mut alice, mut bob) = pair();
    settle(&mut alice, &mut bob).await;

    alice
        .transport
        .simulate_ice_state(IceConnectionState::Disconnected);
    alice.session.closed().await;

    assert!(alice.session.is_closed());
    assert_eq!(alice.session.phase(), NegotiationPhase::Closed);
    assert!(!alice
        .take_outbound()
        .iter()
        .any(|envelope| envelope.kind == kinds::CONNECTION_CLOSE));
}

#[tokio::test]
async fn ice_failure_restarts_instead_of_closing() {
    let (mut alice, mut bob) = pair();
    alice.session.renegotiate().await.unwrap();
    settle(&mut alice, &mut bob).await;
    let before = bob.session.remote_description().unwrap().sdp;

    alice.transport.simulate_ice_state(IceConnectionState::Failed);
    alice.session.ping().await.unwrap();
    assert_eq!(alice.transport.ice_generation(), 1);
    let restart = alice.take_outbound();
    assert_eq!(sdp_of(&restart, SdpType::Offer), 1);

    deliver(&bob.session, &alice.session, restart).await;
    settle(&mut alice, &mut bob).await;
    assert!(!alice.session.is_closed());
    assert_eq!(alice.session.phase(), NegotiationPhase::Stable);
    assert_ne!(bob.session.remote_description().unwrap().sdp, before);
}

#[tokio::test]
async fn removed_track_ends_on_the_remote_side() {
    let (mut alice, mut bob) = pair();
    let mut bob_events = bob.session.events().subscribe();

    let microphone = MediaTrack::new(TrackKind::Audio);
    alice
        .session
        .add_media(Media::Track(Arc::clone(&microphone)), None)
        .unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(bob.session.tracks().len(), 1);
    assert_eq!(bob.session.streams().len(), 1);

    alice
        .session
        .remove_media(&MediaSelector::Kind(TrackKind::Audio))
        .unwrap();
    alice.session.ping().await.unwrap();
    let batch = alice.take_outbound();
    assert!(batch
        .iter()
        .any(|envelope| envelope.kind == kinds::RECEIVER_STOP));
    deliver(&bob.session, &alice.session, batch).await;

    let mut removed_track = false;
    let mut removed_stream = false;
    while !(removed_track && removed_stream) {
        match tokio::time::timeout(Duration::from_secs(1), bob_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SessionEvent::TrackRemoved { track } => {
                assert_eq!(track.id(), microphone.id());
                removed_track = true;
            }
            SessionEvent::StreamRemoved(_) => removed_stream = true,
            _ => {}
        }
    }

    settle(&mut alice, &mut bob).await;
    assert!(bob.session.tracks().is_empty());
    assert!(bob.session.streams().is_empty());
    assert_eq!(
        alice.transport.transceivers()[0].direction,
        TransceiverDirection::Inactive
    );
}

#[tokio::test]
async fn muting_swaps_sender_without_renegotiating() {
    let (mut alice, mut bob) = pair();
    let camera = MediaTrack::new(TrackKind::Video);
    alice
        .session
        .add_media(Media::Track(Arc::clone(&camera)), None)
        .unwrap();
    settle(&mut alice, &mut bob).await;

    alice
        .session
        .mute_media(MediaSelector::Kind(TrackKind::Video), true)
        .await
        .unwrap();
    assert!(alice.transport.transceivers()[0].sender_track.is_none());

    alice
        .session
        .mute_media(MediaSelector::All, false)
        .await
        .unwrap();
    let sender = alice.transport.transceivers()[0].sender_track.clone().unwrap();
    assert_eq!(sender.id(), camera.id());

    let screen = MediaTrack::new(TrackKind::Video);
    alice
        .session
        .replace_track(MediaSelector::Track(camera.id().clone()), Arc::clone(&screen))
        .await
        .unwrap();
    let sender = alice.transport.transceivers()[0].sender_track.clone().unwrap();
    assert_eq!(sender.id(), screen.id());

    let err = alice
        .session
        .replace_track(MediaSelector::Kind(TrackKind::Video), MediaTrack::new(TrackKind::Audio))
        .await
        .unwrap_err();
    assert!(matches!(err, roomcast_core::Error::InvalidState(_)));

    alice.session.ping().await.unwrap();
    assert!(alice.take_outbound().is_empty());
}
