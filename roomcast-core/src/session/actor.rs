use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, trace, warn};

use super::candidates::PendingCandidates;
use super::{
    ChangeKind, Command, LocalTrack, NegotiationPhase, SessionEvent, SessionInput,
    SessionOptions, SessionShared,
};
use crate::error::{Error, Result};
use crate::media::{Media, MediaSelector, MediaStream, MediaTrack};
use crate::signaling::{IceCandidate, SdpType, SessionDescription, Signal, SignalEnvelope, SignalingLink};
use crate::transport::{
    IceConnectionState, PeerTransport, SignalingState, TransceiverDirection, TransportEvent,
};
use crate::types::{StreamId, TrackId};

pub(super) struct SessionActor {
    shared: Arc<SessionShared>,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingLink>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    /// Lets timers and track watchers feed inputs without keeping the session alive
    loopback: mpsc::WeakUnboundedSender<SessionInput>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    options: SessionOptions,
    /// Set while a colliding remote offer was discarded
    ignore_offer: bool,
    renegotiation_pending: bool,
    candidates: PendingCandidates,
    finished: bool,
}

impl SessionActor {
    pub(super) fn new(
        shared: Arc<SessionShared>,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingLink>,
        inputs: mpsc::UnboundedReceiver<SessionInput>,
        loopback: mpsc::WeakUnboundedSender<SessionInput>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        options: SessionOptions,
    ) -> Self {
        Self {
            shared,
            transport,
            signaling,
            inputs,
            loopback,
            transport_events,
            options,
            ignore_offer: false,
            renegotiation_pending: false,
            candidates: PendingCandidates::default(),
            finished: false,
        }
    }

    #[instrument(
        skip_all,
        name = "session",
        fields(local = %self.shared.local, peer = %self.shared.peer)
    )]
    pub(super) async fn run(mut self) {
        debug!("Session actor started");

        while !self.finished {
            // Transport events first, so an input always sees their effects
            tokio::select! {
                biased;

                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                input = self.inputs.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => {
                        debug!("All session handles dropped");
                        self.teardown(false);
                    }
                },
            }
        }

        self.candidates.cancel();
        self.shared.terminated.cancel();
        debug!("Session actor stopped");
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Signal {
                envelope,
                respond_to,
            } => {
                let kind = envelope.kind.clone();
                let result = self.handle_signal(envelope).await;
                if let Err(err) = &result {
                    warn!(kind = %kind, error = %err, "Failed to handle signal");
                }
                reply(respond_to, result);
            }
            SessionInput::Command {
                command,
                respond_to,
            } => {
                let result = if self.finished {
                    Err(Error::Closed(format!("session with {}", self.shared.peer)))
                } else {
                    self.handle_command(command).await
                };
                if let Err(err) = &result {
                    if respond_to.is_none() {
                        warn!(error = %err, "Session command failed");
                    }
                }
                reply(respond_to, result);
            }
            SessionInput::RetryCandidates => self.retry_candidates().await,
            SessionInput::RemoteTrackEnded(id) => self.on_remote_track_ended(&id),
            SessionInput::Ping(respond_to) => {
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) -> Result<()> {
        if let Some(sender) = &envelope.sender {
            if *sender != self.shared.peer {
                debug!(sender = %sender, kind = %envelope.kind, "Ignoring message from another peer");
                return Ok(());
            }
        }

        match envelope.signal()? {
            Signal::Sdp(description) => self.handle_description(description).await,
            Signal::Ice(candidate) => {
                self.handle_remote_candidate(candidate).await;
                Ok(())
            }
            Signal::ConnectionClose => {
                info!("Peer closed the connection");
                self.teardown(false);
                Ok(())
            }
            Signal::ReceiverStop(mid) => {
                self.stop_receiver(&mid);
                Ok(())
            }
            other => {
                debug!(signal = ?other, "Ignoring signal not addressed to sessions");
                Ok(())
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::AddMedia(media) => {
                self.add_media(media);
                Ok(())
            }
            Command::RemoveMedia(selector) => self.remove_media(&selector),
            Command::Mute { selector, muted } => self.mute(&selector, muted),
            Command::ReplaceTrack { selector, track } => self.replace_track(&selector, track),
            Command::Renegotiate => {
                self.negotiate().await;
                Ok(())
            }
            Command::Close => {
                self.teardown(true);
                Ok(())
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.finished {
            return;
        }

        match event {
            TransportEvent::NegotiationNeeded => self.negotiate().await,
            TransportEvent::IceCandidate(Some(candidate)) => {
                let sent = SignalEnvelope::ice(&self.shared.peer, Some(&candidate))
                    .and_then(|envelope| self.signaling.send(envelope));
                if let Err(err) = sent {
                    warn!(error = %err, "Failed to send ICE candidate");
                }
            }
            TransportEvent::IceCandidate(None) => trace!("Local candidate gathering complete"),
            TransportEvent::Track {
                track,
                streams,
                mid,
            } => self.on_remote_track(track, streams, &mid),
            TransportEvent::IceConnectionStateChanged(state) => match state {
                IceConnectionState::Disconnected => {
                    info!("ICE disconnected, closing session");
                    self.teardown(false);
                }
                IceConnectionState::Failed => {
                    warn!("ICE failed, restarting");
                    self.transport.restart_ice();
                }
                other => debug!(state = ?other, "ICE connection state changed"),
            },
            TransportEvent::SignalingStateChanged(_) => self.sync_phase(),
        }
    }

    // --- negotiation -------------------------------------------------------

    async fn negotiate(&mut self) {
        if self.finished {
            return;
        }
        if self.shared.offering.load(Ordering::Acquire)
            || self.phase() != NegotiationPhase::Stable
        {
            debug!(phase = ?self.phase(), "Coalescing renegotiation until stable");
            self.renegotiation_pending = true;
            return;
        }

        self.shared.offering.store(true, Ordering::Release);
        self.shared.events.emit(SessionEvent::NegotiationStarted);

        let result = self.send_offer().await;

        self.shared.offering.store(false, Ordering::Release);
        if let Err(err) = result {
            warn!(error = %err, "Failed to send offer");
            if self.transport.signaling_state() == SignalingState::HaveLocalOffer {
                if let Err(err) = self
                    .transport
                    .set_local_description(SessionDescription::rollback())
                    .await
                {
                    warn!(error = %err, "Failed to roll back unsent offer");
                }
            }
        }
        self.sync_phase();
    }

    async fn send_offer(&mut self) -> Result<()> {
        let offer = self.transport.create_offer().await?;
        if self.transport.signaling_state() != SignalingState::Stable {
            debug!("Signaling state moved while creating offer, dropping it");
            return Ok(());
        }
        self.transport.set_local_description(offer.clone()).await?;
        self.sync_phase();
        self.signaling
            .send(SignalEnvelope::sdp(&self.shared.peer, &offer)?)?;
        debug!("Sent offer");
        Ok(())
    }

    async fn handle_description(&mut self, description: SessionDescription) -> Result<()> {
        match description.sdp_type {
            SdpType::Offer => {
                let phase = self.phase();
                let collision = phase != NegotiationPhase::Stable
                    || self.shared.offering.load(Ordering::Acquire);

                self.ignore_offer = !self.shared.polite && collision;
                if self.ignore_offer {
                    info!(phase = ?phase, "Ignoring colliding offer");
                    return Ok(());
                }

                if collision {
                    debug!(phase = ?phase, "Rolling back local offer for the peer's offer");
                    self.transport
                        .set_local_description(SessionDescription::rollback())
                        .await?;
                }

                self.transport.set_remote_description(description).await?;
                self.sync_phase();
                self.flush_candidates().await;

                let answer = self.transport.create_answer().await?;
                self.transport.set_local_description(answer.clone()).await?;
                self.sync_phase();
                self.signaling
                    .send(SignalEnvelope::sdp(&self.shared.peer, &answer)?)?;
                debug!("Sent answer");
                self.shared.events.emit(SessionEvent::NegotiationFinished);
            }
            SdpType::Answer | SdpType::Pranswer => {
                if self.phase() != NegotiationPhase::HaveLocalOffer {
                    debug!(phase = ?self.phase(), "Ignoring answer with no offer outstanding");
                    return Ok(());
                }
                self.transport.set_remote_description(description).await?;
                self.ignore_offer = false;
                self.sync_phase();
                self.flush_candidates().await;
                self.shared.events.emit(SessionEvent::NegotiationFinished);
            }
            SdpType::Rollback => debug!("Ignoring remote rollback"),
        }

        self.on_stable().await;
        Ok(())
    }

    async fn on_stable(&mut self) {
        if self.finished || self.phase() != NegotiationPhase::Stable {
            return;
        }
        self.attach_pending();
        if std::mem::take(&mut self.renegotiation_pending) {
            self.negotiate().await;
        }
    }

    fn phase(&self) -> NegotiationPhase {
        *self.shared.phase.read()
    }

    fn sync_phase(&self) {
        let phase = if self.finished {
            NegotiationPhase::Closed
        } else {
            self.transport.signaling_state().into()
        };
        *self.shared.phase.write() = phase;
    }

    // --- ICE ---------------------------------------------------------------

    async fn handle_remote_candidate(&mut self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            trace!("Peer finished gathering candidates");
            return;
        };

        if self.transport.remote_description().is_none() {
            debug!("Queueing ICE candidate until a remote description arrives");
            self.candidates.push(candidate);
            self.candidates
                .arm(self.options.ice_retry_interval, self.loopback.clone());
            return;
        }

        self.apply_candidate(candidate).await;
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.transport.add_ice_candidate(candidate).await {
            if self.ignore_offer {
                debug!(error = %err, "Candidate rejected after ignoring an offer");
            } else {
                warn!(error = %err, "Failed to apply ICE candidate");
            }
        }
    }

    async fn flush_candidates(&mut self) {
        if self.candidates.is_empty() || self.transport.remote_description().is_none() {
            return;
        }
        for candidate in self.candidates.take_all() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn retry_candidates(&mut self) {
        self.candidates.timer_fired();
        if self.finished {
            return;
        }
        if self.transport.remote_description().is_some() {
            self.flush_candidates().await;
            return;
        }

        let attempts = self.options.ice_retry_attempts;
        let exhausted = self.candidates.age(attempts);
        if !exhausted.is_empty() {
            if self.ignore_offer {
                debug!(count = exhausted.len(), "Dropping candidates of an ignored offer");
            } else {
                warn!(
                    count = exhausted.len(),
                    attempts,
                    "Dropping ICE candidates, no remote description after retries"
                );
            }
        }
        self.candidates
            .arm(self.options.ice_retry_interval, self.loopback.clone());
    }

    // --- local media -------------------------------------------------------

    fn add_media(&mut self, media: Media) {
        let streams = match &media {
            Media::Track(_) => vec![StreamId::generate()],
            Media::Stream(stream) => vec![stream.id().clone()],
        };

        {
            let mut local = self.shared.local_tracks.write();
            for track in media.tracks() {
                if local.iter().any(|entry| entry.track.id() == track.id()) {
                    debug!(track = %track.id(), "Track already added");
                    continue;
                }
                local.push(LocalTrack {
                    track,
                    streams: streams.clone(),
                    transceiver: None,
                    muted: false,
                });
            }
        }

        if self.phase() == NegotiationPhase::Stable
            && !self.shared.offering.load(Ordering::Acquire)
        {
            self.attach_pending();
        } else {
            debug!(phase = ?self.phase(), "Deferring track attachment until stable");
        }
    }

    /// Give every unattached local track a send-only transceiver
    fn attach_pending(&self) {
        let mut local = self.shared.local_tracks.write();
        for entry in local.iter_mut().filter(|entry| entry.transceiver.is_none()) {
            match self.transport.add_transceiver(
                Arc::clone(&entry.track),
                TransceiverDirection::SendOnly,
                &entry.streams,
            ) {
                Ok(id) => {
                    entry.transceiver = Some(id);
                    if entry.muted {
                        if let Err(err) = self.transport.replace_sender_track(id, None) {
                            warn!(error = %err, "Failed to mute newly attached track");
                        }
                    }
                    debug!(track = %entry.track.id(), kind = %entry.track.kind(), "Attached local track");
                }
                Err(err) => warn!(track = %entry.track.id(), error = %err, "Failed to attach local track"),
            }
        }
    }

    fn remove_media(&mut self, selector: &MediaSelector) -> Result<()> {
        let removed: Vec<LocalTrack> = {
            let mut local = self.shared.local_tracks.write();
            let (removed, kept) = local
                .drain(..)
                .partition(|entry| selector.matches_track(&entry.track, &entry.streams));
            *local = kept;
            removed
        };

        if removed.is_empty() {
            debug!(selector = ?selector, "No local track matched");
            return Ok(());
        }

        let transceivers = self.transport.transceivers();
        for entry in removed {
            let Some(id) = entry.transceiver else {
                continue;
            };
            let info = transceivers.iter().find(|t| t.id == id);
            let direction = info.map_or(TransceiverDirection::Inactive, |t| {
                t.direction.without_send()
            });

            self.transport.replace_sender_track(id, None)?;
            self.transport.set_direction(id, direction)?;
            debug!(track = %entry.track.id(), direction = %direction, "Detached local track");

            if let Some(mid) = info.and_then(|t| t.mid.as_deref()) {
                if let Err(err) = self
                    .signaling
                    .send(SignalEnvelope::receiver_stop(&self.shared.peer, mid))
                {
                    warn!(error = %err, "Failed to send receiver:stop");
                }
            }
        }
        Ok(())
    }

    fn mute(&mut self, selector: &MediaSelector, muted: bool) -> Result<()> {
        let mut local = self.shared.local_tracks.write();
        let mut matched = 0;
        for entry in local
            .iter_mut()
            .filter(|entry| selector.matches_track(&entry.track, &entry.streams))
        {
            matched += 1;
            if entry.muted == muted {
                continue;
            }
            entry.muted = muted;
            if let Some(id) = entry.transceiver {
                let outgoing = (!muted).then(|| Arc::clone(&entry.track));
                self.transport.replace_sender_track(id, outgoing)?;
            }
        }
        debug!(selector = ?selector, muted, matched, "Updated mute state");
        Ok(())
    }

    fn replace_track(&mut self, selector: &MediaSelector, track: Arc<MediaTrack>) -> Result<()> {
        let mut local = self.shared.local_tracks.write();
        let entry = local
            .iter_mut()
            .find(|entry| selector.matches_track(&entry.track, &entry.streams))
            .ok_or_else(|| Error::NotFound(format!("no local track matches {selector:?}")))?;

        if entry.track.kind() != track.kind() {
            return Err(Error::InvalidState(format!(
                "cannot replace a {} track with a {} track",
                entry.track.kind(),
                track.kind()
            )));
        }

        debug!(old = %entry.track.id(), new = %track.id(), "Replacing outgoing track");
        entry.track = Arc::clone(&track);
        if let (Some(id), false) = (entry.transceiver, entry.muted) {
            self.transport.replace_sender_track(id, Some(track))?;
        }
        Ok(())
    }

    // --- remote media ------------------------------------------------------

    fn on_remote_track(&mut self, track: Arc<MediaTrack>, streams: Vec<Arc<MediaStream>>, mid: &str) {
        debug!(track = %track.id(), kind = %track.kind(), mid, "Remote track added");
        self.shared.remote_tracks.write().push(Arc::clone(&track));

        let mut added = Vec::new();
        {
            let mut known = self.shared.remote_streams.write();
            for stream in &streams {
                if !known.iter().any(|k| k.id() == stream.id()) {
                    known.push(Arc::clone(stream));
                    added.push(Arc::clone(stream));
                }
            }
        }

        for stream in added {
            self.shared.events.emit(SessionEvent::StreamAdded(stream));
        }
        self.shared.events.emit(SessionEvent::TrackAdded {
            track: Arc::clone(&track),
            streams: streams.clone(),
        });
        self.shared.events.emit(SessionEvent::MediaChanged {
            change: ChangeKind::Added,
            track: Arc::clone(&track),
            streams,
        });

        let notify = self.loopback.clone();
        tokio::spawn(async move {
            track.ended().await;
            if let Some(tx) = notify.upgrade() {
                let _ = tx.send(SessionInput::RemoteTrackEnded(track.id().clone()));
            }
        });
    }

    fn on_remote_track_ended(&mut self, id: &TrackId) {
        if self.finished {
            return;
        }
        let track = {
            let mut tracks = self.shared.remote_tracks.write();
            let Some(index) = tracks.iter().position(|t| t.id() == id) else {
                return;
            };
            tracks.remove(index)
        };
        debug!(track = %id, "Remote track ended");

        let (containing, inactive): (Vec<Arc<MediaStream>>, Vec<Arc<MediaStream>>) = {
            let mut streams = self.shared.remote_streams.write();
            let containing = streams.iter().filter(|s| s.contains(id)).cloned().collect();
            let (inactive, active) = streams.drain(..).partition(|s| !s.is_active());
            *streams = active;
            (containing, inactive)
        };

        self.shared.events.emit(SessionEvent::TrackRemoved {
            track: Arc::clone(&track),
        });
        self.shared.events.emit(SessionEvent::MediaChanged {
            change: ChangeKind::Removed,
            track,
            streams: containing,
        });
        for stream in inactive {
            debug!(stream = %stream.id(), "Remote stream inactive");
            self.shared.events.emit(SessionEvent::StreamRemoved(stream));
        }
    }

    fn stop_receiver(&self, mid: &str) {
        let receiver = self
            .transport
            .transceivers()
            .into_iter()
            .find(|t| t.mid.as_deref() == Some(mid))
            .and_then(|t| t.receiver_track);
        match receiver {
            Some(track) => {
                debug!(mid, track = %track.id(), "Peer stopped sending");
                track.stop();
            }
            None => debug!(mid, "receiver:stop for unknown transceiver"),
        }
    }

    // --- teardown ----------------------------------------------------------

    fn teardown(&mut self, notify_peer: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.closed.store(true, Ordering::Release);
        self.candidates.cancel();

        if notify_peer {
            if let Err(err) = self
                .signaling
                .send(SignalEnvelope::connection_close(&self.shared.peer))
            {
                debug!(error = %err, "Could not notify peer of close");
            }
        }

        for track in self.shared.remote_tracks.write().drain(..) {
            track.stop();
        }
        self.shared.remote_streams.write().clear();
        self.transport.close();
        self.sync_phase();

        info!("Session closed");
        self.shared.events.emit(SessionEvent::Closed);
    }
}

fn reply(respond_to: Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(tx) = respond_to {
        let _ = tx.send(result);
    }
}
