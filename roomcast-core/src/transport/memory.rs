//! In-process transport
//!
//! Implements the offer/answer state rules of a real peer connection over a
//! compact description format:
//!
//! ```text
//! v=0
//! o=roomcast <tag> <version> IN IP4 127.0.0.1
//! a=ice-ufrag:<ufrag>
//! m=<kind> <mid> <direction> <track-id|-> <stream-id,...|->
//! ```
//!
//! Each side only describes the transceivers it created; mids carry the
//! creator's tag so both ends can tell their own sections apart. Remote
//! sections that send create receiving tracks; sections that stop sending end
//! them. Candidates embed the ICE ufrag and are rejected when they do not
//! belong to the current remote description.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use async_trait::async_trait;

use super::{
    IceConnectionState, PeerTransport, RtpCounters, SignalingState, TransceiverDirection,
    TransceiverId, TransceiverInfo, TransportEvent, TransportFactory, TransportStats,
};
use crate::error::{Error, Result};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::types::{PeerId, StreamId, TrackId};

const NONE: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
struct MediaSection {
    kind: TrackKind,
    mid: String,
    direction: TransceiverDirection,
    track: Option<TrackId>,
    streams: Vec<StreamId>,
}

impl MediaSection {
    fn to_line(&self) -> String {
        let track = self.track.as_ref().map_or(NONE, TrackId::as_str);
        let streams = if self.streams.is_empty() {
            NONE.to_string()
        } else {
            self.streams
                .iter()
                .map(StreamId::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "m={} {} {} {} {}",
            self.kind, self.mid, self.direction, track, streams
        )
    }

    fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [kind, mid, direction, track, streams] = fields.as_slice() else {
            return Err(Error::Transport(format!("malformed media section {line:?}")));
        };

        let kind = kind
            .parse::<TrackKind>()
            .map_err(|_| Error::Transport(format!("unknown media kind in {line:?}")))?;
        let track = (*track != NONE).then(|| TrackId::from(*track));
        let streams = if *streams == NONE {
            Vec::new()
        } else {
            streams.split(',').map(StreamId::from).collect()
        };

        Ok(Self {
            kind,
            mid: (*mid).to_string(),
            direction: direction.parse()?,
            track,
            streams,
        })
    }
}

#[derive(Debug)]
struct ParsedDescription {
    ufrag: String,
    sections: Vec<MediaSection>,
}

fn parse_description(sdp: &str) -> Result<ParsedDescription> {
    let mut ufrag = None;
    let mut sections = Vec::new();

    for line in sdp.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            ufrag = Some(value.to_string());
        } else if let Some(section) = line.strip_prefix("m=") {
            sections.push(MediaSection::parse(section)?);
        }
    }

    Ok(ParsedDescription {
        ufrag: ufrag.ok_or_else(|| Error::Transport("description has no ice-ufrag".to_string()))?,
        sections,
    })
}

fn candidate_ufrag(candidate: &str) -> Option<&str> {
    let mut fields = candidate.split_whitespace();
    fields.find(|f| *f == "ufrag")?;
    fields.next()
}

#[derive(Debug)]
struct Transceiver {
    mid: Option<String>,
    kind: TrackKind,
    direction: TransceiverDirection,
    sender: Option<Arc<MediaTrack>>,
    /// Track id announced in the description; survives `replace_sender_track`
    announced: Option<TrackId>,
    streams: Vec<StreamId>,
    receiver: Option<Arc<MediaTrack>>,
    /// Created locally rather than from a remote section
    owned: bool,
}

#[derive(Debug)]
struct TransportState {
    signaling: SignalingState,
    ice: IceConnectionState,
    current_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    transceivers: Vec<Transceiver>,
    /// Direction last agreed for each owned mid
    negotiated: HashMap<String, TransceiverDirection>,
    remote_streams: HashMap<StreamId, Arc<MediaStream>>,
    remote_candidates: Vec<IceCandidate>,
    ice_generation: u32,
    gathered_generation: Option<u32>,
    ice_restart_pending: bool,
    negotiation_flagged: bool,
    next_mid: usize,
    version: u64,
    stats: TransportStats,
}

impl TransportState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            ice: IceConnectionState::New,
            current_local: None,
            current_remote: None,
            pending_local: None,
            pending_remote: None,
            transceivers: Vec::new(),
            negotiated: HashMap::new(),
            remote_streams: HashMap::new(),
            remote_candidates: Vec::new(),
            ice_generation: 0,
            gathered_generation: None,
            ice_restart_pending: false,
            negotiation_flagged: false,
            next_mid: 0,
            version: 0,
            stats: TransportStats::default(),
        }
    }

    fn remote_description(&self) -> Option<&SessionDescription> {
        self.pending_remote.as_ref().or(self.current_remote.as_ref())
    }

    fn local_description(&self) -> Option<&SessionDescription> {
        self.pending_local.as_ref().or(self.current_local.as_ref())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.signaling == SignalingState::Closed {
            Err(Error::Closed("transport".to_string()))
        } else {
            Ok(())
        }
    }

    fn needs_negotiation(&self) -> bool {
        self.ice_restart_pending
            || self.transceivers.iter().filter(|t| t.owned).any(|t| {
                t.mid
                    .as_ref()
                    .and_then(|mid| self.negotiated.get(mid))
                    .is_none_or(|agreed| *agreed != t.direction)
            })
    }

    /// Raise negotiation-needed once per stable period
    fn check_negotiation(&mut self, events: &mut Vec<TransportEvent>) {
        if self.signaling == SignalingState::Stable
            && !self.negotiation_flagged
            && self.needs_negotiation()
        {
            self.negotiation_flagged = true;
            events.push(TransportEvent::NegotiationNeeded);
        }
    }

    fn set_signaling(&mut self, state: SignalingState, events: &mut Vec<TransportEvent>) {
        if self.signaling != state {
            self.signaling = state;
            events.push(TransportEvent::SignalingStateChanged(state));
        }
    }

    fn set_ice(&mut self, state: IceConnectionState, events: &mut Vec<TransportEvent>) {
        if self.ice != state {
            self.ice = state;
            events.push(TransportEvent::IceConnectionStateChanged(state));
        }
    }

    fn rollback(&mut self, events: &mut Vec<TransportEvent>) -> Result<()> {
        match self.signaling {
            SignalingState::HaveLocalOffer => self.pending_local = None,
            SignalingState::HaveRemoteOffer => self.pending_remote = None,
            SignalingState::Stable => {
                return Err(Error::InvalidState("nothing to roll back in stable".to_string()))
            }
            SignalingState::Closed => return Err(Error::Closed("transport".to_string())),
        }
        self.set_signaling(SignalingState::Stable, events);
        self.check_negotiation(events);
        Ok(())
    }

    fn apply_remote_sections(
        &mut self,
        own_prefix: &str,
        sections: &[MediaSection],
        events: &mut Vec<TransportEvent>,
    ) {
        for section in sections.iter().filter(|s| !s.mid.starts_with(own_prefix)) {
            let index = match self
                .transceivers
                .iter()
                .position(|t| t.mid.as_deref() == Some(section.mid.as_str()))
            {
                Some(index) => index,
                None => {
                    self.transceivers.push(Transceiver {
                        mid: Some(section.mid.clone()),
                        kind: section.kind,
                        direction: section.direction.reversed(),
                        sender: None,
                        announced: None,
                        streams: Vec::new(),
                        receiver: None,
                        owned: false,
                    });
                    self.transceivers.len() - 1
                }
            };

            let transceiver = &mut self.transceivers[index];
            transceiver.direction = section.direction.reversed();

            match (&section.track, section.direction.sends()) {
                (Some(track_id), true) => {
                    let receiving = transceiver
                        .receiver
                        .as_ref()
                        .is_some_and(|r| r.id() == track_id && r.is_live());
                    if receiving {
                        continue;
                    }

                    let track = MediaTrack::with_id(track_id.clone(), section.kind);
                    transceiver.receiver = Some(Arc::clone(&track));

                    let streams = section
                        .streams
                        .iter()
                        .map(|stream_id| {
                            let stream = self
                                .remote_streams
                                .entry(stream_id.clone())
                                .or_insert_with(|| MediaStream::with_id(stream_id.clone(), Vec::new()));
                            stream.add_track(Arc::clone(&track));
                            Arc::clone(stream)
                        })
                        .collect();

                    events.push(TransportEvent::Track {
                        track,
                        streams,
                        mid: section.mid.clone(),
                    });
                }
                _ => {
                    if let Some(receiver) = &transceiver.receiver {
                        receiver.stop();
                    }
                }
            }
        }
    }

    fn gather(&mut self, tag: &str, events: &mut Vec<TransportEvent>) {
        if self.local_description().is_none() || self.gathered_generation == Some(self.ice_generation)
        {
            return;
        }
        self.gathered_generation = Some(self.ice_generation);

        let generation = self.ice_generation;
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{generation} 1 udp 2130706431 127.0.0.1 {} typ host ufrag {}",
                50_000 + generation,
                ufrag(tag, generation)
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        events.push(TransportEvent::IceCandidate(Some(candidate)));
        events.push(TransportEvent::IceCandidate(None));
    }
}

fn ufrag(tag: &str, generation: u32) -> String {
    format!("{tag}g{generation}")
}

pub struct MemoryTransport {
    tag: String,
    state: Mutex<TransportState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    fail_next_offer: AtomicBool,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("tag", &self.tag)
            .field("signaling", &self.state.lock().signaling)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            tag: nanoid::nanoid!(8),
            state: Mutex::new(TransportState::new()),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            fail_next_offer: AtomicBool::new(false),
        }
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mid_prefix(&self) -> String {
        format!("{}:", self.tag)
    }

    fn dispatch(&self, events: Vec<TransportEvent>) {
        for event in events {
            trace!(tag = %self.tag, ?event, "Transport event");
            let _ = self.events.send(event);
        }
    }

    /// Drive the ICE connection state, as network changes would
    pub fn simulate_ice_state(&self, state: IceConnectionState) {
        let mut events = Vec::new();
        self.state.lock().set_ice(state, &mut events);
        self.dispatch(events);
    }

    /// Make the next `create_offer` fail
    pub fn fail_next_offer(&self) {
        self.fail_next_offer.store(true, Ordering::SeqCst);
    }

    /// Account traffic as if packets had crossed the connection
    pub fn simulate_traffic(&self, inbound: RtpCounters, outbound: RtpCounters) {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        for (total, delta) in [(&mut stats.inbound, inbound), (&mut stats.outbound, outbound)] {
            total.bytes += delta.bytes;
            total.packets += delta.packets;
            total.packets_lost += delta.packets_lost;
        }
    }

    /// Candidates successfully applied so far
    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    #[must_use]
    pub fn ice_generation(&self) -> u32 {
        self.state.lock().ice_generation
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description().cloned()
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description().cloned()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if self.fail_next_offer.swap(false, Ordering::SeqCst) {
            return Err(Error::Transport("offer creation failed".to_string()));
        }

        let state = &mut *state;
        let mut sections = Vec::new();
        for transceiver in state.transceivers.iter_mut().filter(|t| t.owned) {
            let mid = transceiver.mid.get_or_insert_with(|| {
                state.next_mid += 1;
                format!("{}:{}", self.tag, state.next_mid)
            });
            let sends = transceiver.direction.sends();
            sections.push(MediaSection {
                kind: transceiver.kind,
                mid: mid.clone(),
                direction: transceiver.direction,
                track: if sends { transceiver.announced.clone() } else { None },
                streams: if sends { transceiver.streams.clone() } else { Vec::new() },
            });
        }

        state.version += 1;
        Ok(SessionDescription::offer(self.render(
            state.version,
            state.ice_generation,
            &sections,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let remote = match (&state.signaling, &state.pending_remote) {
            (SignalingState::HaveRemoteOffer, Some(remote)) => parse_description(&remote.sdp)?,
            (signaling, _) => {
                return Err(Error::InvalidState(format!(
                    "cannot answer in {signaling:?}"
                )))
            }
        };

        let sections: Vec<MediaSection> = remote
            .sections
            .into_iter()
            .map(|section| MediaSection {
                direction: section.direction.reversed(),
                track: None,
                streams: Vec::new(),
                ..section
            })
            .collect();

        state.version += 1;
        Ok(SessionDescription::answer(self.render(
            state.version,
            state.ice_generation,
            &sections,
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;

            match description.sdp_type {
                SdpType::Rollback => state.rollback(&mut events)?,
                SdpType::Offer => {
                    if !matches!(
                        state.signaling,
                        SignalingState::Stable | SignalingState::HaveLocalOffer
                    ) {
                        return Err(Error::InvalidState(format!(
                            "cannot apply a local offer in {:?}",
                            state.signaling
                        )));
                    }
                    parse_description(&description.sdp)?;
                    state.pending_local = Some(description);
                    state.negotiation_flagged = false;
                    state.ice_restart_pending = false;
                    state.set_signaling(SignalingState::HaveLocalOffer, &mut events);
                }
                SdpType::Answer | SdpType::Pranswer => {
                    if state.signaling != SignalingState::HaveRemoteOffer {
                        return Err(Error::InvalidState(format!(
                            "cannot apply a local answer in {:?}",
                            state.signaling
                        )));
                    }
                    parse_description(&description.sdp)?;
                    state.current_remote = state.pending_remote.take();
                    state.current_local = Some(description);
                    state.set_signaling(SignalingState::Stable, &mut events);
                    state.check_negotiation(&mut events);
                }
            }

            state.gather(&self.tag, &mut events);
        }
        self.dispatch(events);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;

            match description.sdp_type {
                SdpType::Rollback => {
                    if state.signaling != SignalingState::HaveRemoteOffer {
                        return Err(Error::InvalidState(format!(
                            "cannot roll back a remote offer in {:?}",
                            state.signaling
                        )));
                    }
                    state.rollback(&mut events)?;
                }
                SdpType::Offer => {
                    if state.signaling == SignalingState::HaveLocalOffer {
                        return Err(Error::InvalidState(
                            "remote offer while a local offer is pending".to_string(),
                        ));
                    }
                    let parsed = parse_description(&description.sdp)?;
                    state.pending_remote = Some(description);
                    state.set_signaling(SignalingState::HaveRemoteOffer, &mut events);
                    state.apply_remote_sections(&self.mid_prefix(), &parsed.sections, &mut events);
                }
                SdpType::Answer | SdpType::Pranswer => {
                    if state.signaling != SignalingState::HaveLocalOffer {
                        return Err(Error::InvalidState(format!(
                            "cannot apply a remote answer in {:?}",
                            state.signaling
                        )));
                    }
                    let parsed = parse_description(&description.sdp)?;
                    let offer = state
                        .pending_local
                        .take()
                        .ok_or_else(|| Error::InvalidState("no pending local offer".to_string()))?;
                    for section in parse_description(&offer.sdp)?.sections {
                        state.negotiated.insert(section.mid, section.direction);
                    }
                    state.current_local = Some(offer);
                    state.current_remote = Some(description);
                    state.set_signaling(SignalingState::Stable, &mut events);
                    state.apply_remote_sections(&self.mid_prefix(), &parsed.sections, &mut events);
                    state.check_negotiation(&mut events);
                }
            }

            if state.ice == IceConnectionState::New && state.remote_description().is_some() {
                state.set_ice(IceConnectionState::Checking, &mut events);
            }
        }
        self.dispatch(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;

            let remote = state
                .remote_description()
                .ok_or_else(|| Error::InvalidState("no remote description".to_string()))?;
            let expected = parse_description(&remote.sdp)?.ufrag;
            if let Some(ufrag) = candidate_ufrag(&candidate.candidate) {
                if ufrag != expected {
                    return Err(Error::Transport(format!(
                        "candidate for ufrag {ufrag} does not match remote description ({expected})"
                    )));
                }
            }

            state.remote_candidates.push(candidate);
            if matches!(
                state.ice,
                IceConnectionState::New | IceConnectionState::Checking
            ) {
                state.set_ice(IceConnectionState::Connected, &mut events);
            }
        }
        self.dispatch(events);
        Ok(())
    }

    fn add_transceiver(
        &self,
        track: Arc<MediaTrack>,
        direction: TransceiverDirection,
        streams: &[StreamId],
    ) -> Result<TransceiverId> {
        let mut events = Vec::new();
        let id = {
            let mut state = self.state.lock();
            state.ensure_open()?;

            if state
                .transceivers
                .iter()
                .any(|t| t.sender.as_ref().is_some_and(|s| s.id() == track.id()))
            {
                return Err(Error::InvalidState(format!(
                    "track {} already has a sender",
                    track.id()
                )));
            }

            state.transceivers.push(Transceiver {
                mid: None,
                kind: track.kind(),
                direction,
                announced: Some(track.id().clone()),
                sender: Some(track),
                streams: streams.to_vec(),
                receiver: None,
                owned: true,
            });
            state.check_negotiation(&mut events);
            state.transceivers.len() - 1
        };
        self.dispatch(events);
        Ok(id)
    }

    fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.state
            .lock()
            .transceivers
            .iter()
            .enumerate()
            .map(|(id, t)| TransceiverInfo {
                id,
                mid: t.mid.clone(),
                kind: t.kind,
                direction: t.direction,
                sender_track: t.sender.clone(),
                receiver_track: t.receiver.clone(),
            })
            .collect()
    }

    fn set_direction(&self, id: TransceiverId, direction: TransceiverDirection) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let transceiver = state
                .transceivers
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("transceiver {id}")))?;
            if transceiver.direction == direction {
                return Ok(());
            }
            if !transceiver.owned && direction.sends() {
                return Err(Error::InvalidState(format!(
                    "transceiver {id} was created by the remote side and cannot send"
                )));
            }
            transceiver.direction = direction;
            state.check_negotiation(&mut events);
        }
        self.dispatch(events);
        Ok(())
    }

    fn replace_sender_track(
        &self,
        id: TransceiverId,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let transceiver = state
            .transceivers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("transceiver {id}")))?;
        if let Some(track) = &track {
            if track.kind() != transceiver.kind {
                return Err(Error::InvalidState(format!(
                    "cannot send {} on a {} transceiver",
                    track.kind(),
                    transceiver.kind
                )));
            }
        }
        transceiver.sender = track;
        Ok(())
    }

    fn restart_ice(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.ensure_open().is_err() {
                return;
            }
            state.ice_generation += 1;
            state.ice_restart_pending = true;
            state.set_ice(IceConnectionState::Checking, &mut events);
            state.check_negotiation(&mut events);
            debug!(tag = %self.tag, generation = state.ice_generation, "ICE restart requested");
        }
        self.dispatch(events);
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(self.state.lock().stats)
    }

    fn close(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.set_signaling(SignalingState::Closed, &mut events);
            state.set_ice(IceConnectionState::Closed, &mut events);
        }
        self.dispatch(events);
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.lock().take()
    }
}

impl MemoryTransport {
    fn render(&self, version: u64, generation: u32, sections: &[MediaSection]) -> String {
        let mut sdp = format!(
            "v=0\r\no=roomcast {} {version} IN IP4 127.0.0.1\r\ns=-\r\na=ice-ufrag:{}\r\n",
            self.tag,
            ufrag(&self.tag, generation)
        );
        for section in sections {
            sdp.push_str(&section.to_line());
            sdp.push_str("\r\n");
        }
        sdp
    }
}

/// Creates [`MemoryTransport`]s and keeps the latest one per remote peer
#[derive(Debug, Default)]
pub struct MemoryTransportFactory {
    transports: DashMap<PeerId, Arc<MemoryTransport>>,
}

impl MemoryTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent transport created towards `remote`
    #[must_use]
    pub fn transport(&self, remote: &PeerId) -> Option<Arc<MemoryTransport>> {
        self.transports.get(remote).map(|t| Arc::clone(t.value()))
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, local: &PeerId, remote: &PeerId) -> Result<Arc<dyn PeerTransport>> {
        let transport = MemoryTransport::new();
        debug!(local = %local, remote = %remote, tag = %transport.tag, "Created memory transport");
        self.transports.insert(remote.clone(), Arc::clone(&transport));
        Ok(transport)
    }
}
