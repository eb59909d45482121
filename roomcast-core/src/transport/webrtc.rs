//! Transport over a webrtc-rs `RTCPeerConnection`
//!
//! The connection is created on a worker task; transceiver changes requested
//! through the synchronous trait methods are queued to that worker in order,
//! and every async method waits for the queue to drain first. Local tracks
//! are bound to sample tracks that emit a minimal payload per frame interval
//! so the far end sees them arrive; frames are composited locally and are not
//! encoded onto the wire.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    IceConnectionState, PeerTransport, RtpCounters, SignalingState, TransceiverDirection,
    TransceiverId, TransceiverInfo, TransportEvent, TransportFactory, TransportStats,
};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::types::{PeerId, StreamId, TrackId};

/// Opus frame for 20 ms of silence
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const VIDEO_PLACEHOLDER: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a];

const AUDIO_INTERVAL: Duration = Duration::from_millis(20);
const VIDEO_INTERVAL: Duration = Duration::from_millis(33);

fn transport_error(context: &'static str) -> impl FnOnce(webrtc::Error) -> Error {
    move |e| Error::Transport(format!("{context}: {e}"))
}

fn signaling_from(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn ice_from(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => IceConnectionState::New,
    }
}

const fn direction_to(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

fn direction_from(direction: RTCRtpTransceiverDirection) -> TransceiverDirection {
    match direction {
        RTCRtpTransceiverDirection::Sendrecv => TransceiverDirection::SendRecv,
        RTCRtpTransceiverDirection::Sendonly => TransceiverDirection::SendOnly,
        RTCRtpTransceiverDirection::Recvonly => TransceiverDirection::RecvOnly,
        RTCRtpTransceiverDirection::Inactive | RTCRtpTransceiverDirection::Unspecified => {
            TransceiverDirection::Inactive
        }
    }
}

fn kind_from(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Audio => TrackKind::Audio,
        _ => TrackKind::Video,
    }
}

fn description_to(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp.clone();
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp).map_err(transport_error("offer")),
        SdpType::Answer => RTCSessionDescription::answer(sdp).map_err(transport_error("answer")),
        SdpType::Pranswer => {
            RTCSessionDescription::pranswer(sdp).map_err(transport_error("pranswer"))
        }
        // No public constructor for rollback
        SdpType::Rollback => Ok(serde_json::from_value(serde_json::json!({
            "type": "rollback",
            "sdp": "",
        }))?),
    }
}

fn description_from(description: &RTCSessionDescription) -> Option<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback | RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

fn candidate_from(candidate: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

/// Write placeholder samples for `track` until it ends or `cancel` fires
fn spawn_pump(
    writer: Arc<TrackLocalStaticSample>,
    track: Arc<MediaTrack>,
    cancel: CancellationToken,
) {
    let (payload, interval) = match track.kind() {
        TrackKind::Audio => (Bytes::from_static(OPUS_SILENCE), AUDIO_INTERVAL),
        TrackKind::Video => (Bytes::from_static(VIDEO_PLACEHOLDER), VIDEO_INTERVAL),
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = track.ended() => break,
                _ = ticker.tick() => {}
            }
            if track.is_muted() {
                continue;
            }
            let sample = Sample {
                data: payload.clone(),
                duration: interval,
                ..Default::default()
            };
            if let Err(e) = writer.write_sample(&sample).await {
                trace!(track = %track.id(), error = %e, "Sample pump stopped");
                break;
            }
        }
    });
}

struct Entry {
    kind: TrackKind,
    direction: TransceiverDirection,
    sender: Option<Arc<MediaTrack>>,
    receiver: Option<Arc<MediaTrack>>,
    /// Bound once the worker has added the transceiver
    rtc: Option<Arc<RTCRtpTransceiver>>,
    writer: Option<Arc<TrackLocalStaticSample>>,
    pump: Option<CancellationToken>,
    owned: bool,
}

impl Entry {
    fn info(&self, id: TransceiverId) -> TransceiverInfo {
        TransceiverInfo {
            id,
            mid: self.rtc.as_ref().and_then(|rtc| rtc.mid().map(|m| m.to_string())),
            kind: self.kind,
            direction: self.direction,
            sender_track: self.sender.clone(),
            receiver_track: self.receiver.clone(),
        }
    }

    fn restart_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        if let (Some(writer), Some(track)) = (&self.writer, &self.sender) {
            let cancel = CancellationToken::new();
            spawn_pump(Arc::clone(writer), Arc::clone(track), cancel.clone());
            self.pump = Some(cancel);
        }
    }
}

#[derive(Default)]
struct Mirror {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    entries: Vec<Entry>,
    remote_streams: HashMap<StreamId, Arc<MediaStream>>,
}

enum Op {
    Add {
        index: TransceiverId,
        stream: String,
    },
    Direction {
        index: TransceiverId,
        direction: TransceiverDirection,
    },
    Replace {
        index: TransceiverId,
    },
    Flush(oneshot::Sender<()>),
}

struct Shared {
    tag: String,
    pc: OnceLock<Arc<RTCPeerConnection>>,
    mirror: Mutex<Mirror>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
    ice_restart: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        trace!(tag = %self.tag, ?event, "Transport event");
        let _ = self.events.send(event);
    }

    fn on_remote_track(&self, track: &Arc<TrackRemote>, transceiver: &Arc<RTCRtpTransceiver>) {
        let kind = kind_from(track.kind());
        let media = MediaTrack::with_id(TrackId::from(track.id()), kind);
        let stream_id = match track.stream_id() {
            id if id.is_empty() => StreamId::generate(),
            id => StreamId::from(id),
        };
        let mid = transceiver.mid().unwrap_or_default();

        let stream = {
            let mut mirror = self.mirror.lock();
            let stream = Arc::clone(
                mirror
                    .remote_streams
                    .entry(stream_id.clone())
                    .or_insert_with(|| MediaStream::with_id(stream_id, Vec::new())),
            );
            stream.add_track(Arc::clone(&media));

            match mirror
                .entries
                .iter_mut()
                .find(|entry| entry.rtc.as_ref().is_some_and(|rtc| Arc::ptr_eq(rtc, transceiver)))
            {
                Some(entry) => {
                    if let Some(previous) = entry.receiver.replace(Arc::clone(&media)) {
                        previous.stop();
                    }
                }
                None => mirror.entries.push(Entry {
                    kind,
                    direction: TransceiverDirection::RecvOnly,
                    sender: None,
                    receiver: Some(Arc::clone(&media)),
                    rtc: Some(Arc::clone(transceiver)),
                    writer: None,
                    pump: None,
                    owned: false,
                }),
            }
            stream
        };

        debug!(tag = %self.tag, track = %media.id(), %mid, "Remote track arrived");
        self.emit(TransportEvent::Track {
            track: Arc::clone(&media),
            streams: vec![stream],
            mid: mid.to_string(),
        });

        // The remote track lives as long as RTP can be read from it
        let track = Arc::clone(track);
        tokio::spawn(async move {
            while !media.is_ended() {
                if track.read_rtp().await.is_err() {
                    break;
                }
            }
            media.stop();
        });
    }

    fn install_handlers(self: &Arc<Self>, pc: &RTCPeerConnection) {
        let shared = Arc::downgrade(self);
        pc.on_negotiation_needed(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.emit(TransportEvent::NegotiationNeeded);
            }
            Box::pin(async {})
        }));

        let shared = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(shared) = shared.upgrade() {
                match candidate.map(|c| c.to_json()).transpose() {
                    Ok(candidate) => {
                        shared.emit(TransportEvent::IceCandidate(candidate.map(candidate_from)));
                    }
                    Err(e) => warn!(tag = %shared.tag, error = %e, "Unserializable candidate"),
                }
            }
            Box::pin(async {})
        }));

        let shared = Arc::downgrade(self);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(shared) = shared.upgrade() {
                shared.emit(TransportEvent::IceConnectionStateChanged(ice_from(state)));
            }
            Box::pin(async {})
        }));

        let shared = Arc::downgrade(self);
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            if let Some(shared) = shared.upgrade() {
                shared.emit(TransportEvent::SignalingStateChanged(signaling_from(state)));
            }
            Box::pin(async {})
        }));

        let shared: Weak<Self> = Arc::downgrade(self);
        pc.on_track(Box::new(move |track, _receiver, transceiver| {
            if let Some(shared) = shared.upgrade() {
                shared.on_remote_track(&track, &transceiver);
            }
            Box::pin(async {})
        }));
    }

    async fn apply(&self, pc: &RTCPeerConnection, op: Op) -> Result<()> {
        match op {
            Op::Add { index, stream } => {
                let (kind, direction, track) = {
                    let mirror = self.mirror.lock();
                    let entry = &mirror.entries[index];
                    (entry.kind, entry.direction, entry.sender.clone())
                };
                let track_id = track
                    .as_ref()
                    .map_or_else(|| TrackId::generate().to_string(), |t| t.id().to_string());
                let writer = Arc::new(TrackLocalStaticSample::new(
                    codec_for(kind),
                    track_id,
                    stream,
                ));
                let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(&writer) as _;
                let rtc = pc
                    .add_transceiver_from_track(
                        local,
                        Some(RTCRtpTransceiverInit {
                            direction: direction_to(direction),
                            send_encodings: Vec::new(),
                        }),
                    )
                    .await
                    .map_err(transport_error("add transceiver"))?;

                let mut mirror = self.mirror.lock();
                let entry = &mut mirror.entries[index];
                entry.rtc = Some(rtc);
                entry.writer = Some(writer);
                entry.restart_pump();
            }
            Op::Direction { index, direction } => {
                let rtc = self.mirror.lock().entries[index].rtc.clone();
                if let Some(rtc) = rtc {
                    rtc.set_direction(direction_to(direction)).await;
                }
            }
            Op::Replace { index } => {
                let (rtc, writer, sending) = {
                    let mut mirror = self.mirror.lock();
                    let entry = &mut mirror.entries[index];
                    entry.restart_pump();
                    (entry.rtc.clone(), entry.writer.clone(), entry.sender.is_some())
                };
                if let (Some(rtc), Some(writer)) = (rtc, writer) {
                    let track = sending.then(|| writer as Arc<dyn TrackLocal + Send + Sync>);
                    rtc.sender()
                        .await
                        .replace_track(track)
                        .await
                        .map_err(transport_error("replace track"))?;
                }
            }
            Op::Flush(done) => {
                let _ = done.send(());
            }
        }
        Ok(())
    }

    async fn refresh_descriptions(&self, pc: &RTCPeerConnection) {
        let local = pc.local_description().await;
        let remote = pc.remote_description().await;
        let mut mirror = self.mirror.lock();
        mirror.local = local.as_ref().and_then(description_from);
        mirror.remote = remote.as_ref().and_then(description_from);
    }
}

async fn run(
    api: Arc<API>,
    configuration: RTCConfiguration,
    shared: Arc<Shared>,
    mut ops: mpsc::UnboundedReceiver<Op>,
) {
    let pc = match api.new_peer_connection(configuration).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            warn!(tag = %shared.tag, error = %e, "Failed to create peer connection");
            return;
        }
    };
    shared.install_handlers(&pc);
    let _ = shared.pc.set(Arc::clone(&pc));
    debug!(tag = %shared.tag, "Peer connection ready");

    if shared.closed.load(Ordering::SeqCst) {
        let _ = pc.close().await;
        return;
    }

    while let Some(op) = ops.recv().await {
        if let Err(e) = shared.apply(&pc, op).await {
            warn!(tag = %shared.tag, error = %e, "Transceiver update failed");
        }
    }
}

pub struct WebRtcTransport {
    shared: Arc<Shared>,
    ops: mpsc::UnboundedSender<Op>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("tag", &self.shared.tag)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WebRtcTransport {
    /// Start the worker that owns the peer connection; must run inside a
    /// tokio runtime
    #[must_use]
    pub fn spawn(api: Arc<API>, configuration: RTCConfiguration) -> Arc<Self> {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (ops, op_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tag: nanoid::nanoid!(8),
            pc: OnceLock::new(),
            mirror: Mutex::new(Mirror::default()),
            events,
            closed: AtomicBool::new(false),
            ice_restart: AtomicBool::new(false),
        });
        tokio::spawn(run(api, configuration, Arc::clone(&shared), op_rx));

        Arc::new(Self {
            shared,
            ops,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    fn queue(&self, op: Op) -> Result<()> {
        self.ops
            .send(op)
            .map_err(|_| Error::Closed("peer connection worker".to_string()))
    }

    /// Wait for queued transceiver changes, then hand out the connection
    async fn connection(&self) -> Result<Arc<RTCPeerConnection>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("transport".to_string()));
        }
        let (done, flushed) = oneshot::channel();
        self.queue(Op::Flush(done))?;
        flushed
            .await
            .map_err(|_| Error::Closed("peer connection worker".to_string()))?;
        self.shared
            .pc
            .get()
            .cloned()
            .ok_or_else(|| Error::Closed("peer connection".to_string()))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn signaling_state(&self) -> SignalingState {
        if self.shared.closed.load(Ordering::SeqCst) {
            return SignalingState::Closed;
        }
        self.shared
            .pc
            .get()
            .map_or(SignalingState::Stable, |pc| signaling_from(pc.signaling_state()))
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        if self.shared.closed.load(Ordering::SeqCst) {
            return IceConnectionState::Closed;
        }
        self.shared
            .pc
            .get()
            .map_or(IceConnectionState::New, |pc| ice_from(pc.ice_connection_state()))
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.shared.mirror.lock().local.clone()
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        self.shared.mirror.lock().remote.clone()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let pc = self.connection().await?;
        let options = RTCOfferOptions {
            ice_restart: self.shared.ice_restart.swap(false, Ordering::SeqCst),
            ..Default::default()
        };
        let offer = pc
            .create_offer(Some(options))
            .await
            .map_err(transport_error("create offer"))?;
        description_from(&offer).ok_or_else(|| Error::Transport("empty offer".to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let pc = self.connection().await?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(transport_error("create answer"))?;
        description_from(&answer).ok_or_else(|| Error::Transport("empty answer".to_string()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let pc = self.connection().await?;
        pc.set_local_description(description_to(&description)?)
            .await
            .map_err(transport_error("set local description"))?;
        self.shared.refresh_descriptions(&pc).await;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let pc = self.connection().await?;
        pc.set_remote_description(description_to(&description)?)
            .await
            .map_err(transport_error("set remote description"))?;
        self.shared.refresh_descriptions(&pc).await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let pc = self.connection().await?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await
        .map_err(transport_error("add candidate"))
    }

    fn add_transceiver(
        &self,
        track: Arc<MediaTrack>,
        direction: TransceiverDirection,
        streams: &[StreamId],
    ) -> Result<TransceiverId> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("transport".to_string()));
        }
        let stream = streams
            .first()
            .map_or_else(|| track.id().to_string(), ToString::to_string);

        let index = {
            let mut mirror = self.shared.mirror.lock();
            mirror.entries.push(Entry {
                kind: track.kind(),
                direction,
                sender: Some(track),
                receiver: None,
                rtc: None,
                writer: None,
                pump: None,
                owned: true,
            });
            mirror.entries.len() - 1
        };
        self.queue(Op::Add { index, stream })?;
        Ok(index)
    }

    fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.shared
            .mirror
            .lock()
            .entries
            .iter()
            .enumerate()
            .map(|(id, entry)| entry.info(id))
            .collect()
    }

    fn set_direction(&self, id: TransceiverId, direction: TransceiverDirection) -> Result<()> {
        {
            let mut mirror = self.shared.mirror.lock();
            let entry = mirror
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("transceiver {id}")))?;
            if !entry.owned && direction.sends() {
                return Err(Error::InvalidState(format!(
                    "transceiver {id} has no local track to send"
                )));
            }
            entry.direction = direction;
        }
        self.queue(Op::Direction {
            index: id,
            direction,
        })
    }

    fn replace_sender_track(
        &self,
        id: TransceiverId,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<()> {
        {
            let mut mirror = self.shared.mirror.lock();
            let entry = mirror
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("transceiver {id}")))?;
            if let Some(track) = &track {
                if track.kind() != entry.kind {
                    return Err(Error::InvalidState(format!(
                        "cannot send {} on a {} transceiver",
                        track.kind(),
                        entry.kind
                    )));
                }
            }
            entry.sender = track;
        }
        self.queue(Op::Replace { index: id })
    }

    fn restart_ice(&self) {
        self.shared.ice_restart.store(true, Ordering::SeqCst);
        self.shared.emit(TransportEvent::NegotiationNeeded);
    }

    async fn stats(&self) -> Result<TransportStats> {
        let pc = self.connection().await?;
        let report = pc.get_stats().await;

        let mut stats = TransportStats::default();
        for entry in report.reports.values() {
            match entry {
                StatsReportType::InboundRTP(inbound) => {
                    add(&mut stats.inbound, inbound.bytes_received, inbound.packets_received, 0);
                }
                StatsReportType::OutboundRTP(outbound) => {
                    add(&mut stats.outbound, outbound.bytes_sent, outbound.packets_sent, 0);
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    let lost = u64::try_from(remote.packets_lost).unwrap_or(0);
                    add(&mut stats.outbound, 0, 0, lost);
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut mirror = self.shared.mirror.lock();
            for entry in &mut mirror.entries {
                if let Some(pump) = entry.pump.take() {
                    pump.cancel();
                }
                if let Some(receiver) = &entry.receiver {
                    receiver.stop();
                }
            }
        }
        if let Some(pc) = self.shared.pc.get().cloned() {
            let tag = self.shared.tag.clone();
            tokio::spawn(async move {
                if let Err(e) = pc.close().await {
                    warn!(%tag, error = %e, "Peer connection did not close cleanly");
                }
            });
        }
        self.shared
            .emit(TransportEvent::SignalingStateChanged(SignalingState::Closed));
        self.shared
            .emit(TransportEvent::IceConnectionStateChanged(IceConnectionState::Closed));
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.lock().take()
    }
}

fn add(counters: &mut RtpCounters, bytes: u64, packets: u64, lost: u64) {
    counters.bytes += bytes;
    counters.packets += packets;
    counters.packets_lost += lost;
}

/// Builds one webrtc API and creates a [`WebRtcTransport`] per remote peer
pub struct WebRtcTransportFactory {
    api: Arc<API>,
    configuration: RTCConfiguration,
}

impl std::fmt::Debug for WebRtcTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransportFactory")
            .field("ice_servers", &self.configuration.ice_servers.len())
            .finish_non_exhaustive()
    }
}

impl WebRtcTransportFactory {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error("register codecs"))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_error("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api: Arc::new(api),
            configuration: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

impl TransportFactory for WebRtcTransportFactory {
    fn create(&self, local: &PeerId, remote: &PeerId) -> Result<Arc<dyn PeerTransport>> {
        let transport = WebRtcTransport::spawn(Arc::clone(&self.api), self.configuration.clone());
        debug!(local = %local, remote = %remote, tag = %transport.shared.tag, "Created webrtc transport");
        Ok(transport)
    }
}
