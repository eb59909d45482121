//! Transmission reports and serializable session snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{NegotiationPhase, PeerSession};
use crate::error::Result;
use crate::transport::{IceConnectionState, RtpCounters, TransceiverInfo, TransportStats};
use crate::types::{PeerId, StreamId};

/// Traffic in one direction over a watch window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionReport {
    /// Bytes carried during the window
    pub bytes: u64,

    /// Packets carried during the window
    pub packets: u64,

    /// Packets lost during the window
    pub packet_loss: u64,

    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss_rate: f32,

    /// Bytes per second over the window
    pub bytes_per_second: f64,

    /// Live tracks currently flowing in this direction
    pub tracks: usize,
}

impl DirectionReport {
    fn new(delta: RtpCounters, window: Duration, tracks: usize) -> Self {
        let expected = delta.packets + delta.packets_lost;
        let packet_loss_rate = if expected == 0 {
            0.0
        } else {
            delta.packets_lost as f32 / expected as f32
        };
        let seconds = window.as_secs_f64();
        let bytes_per_second = if seconds > 0.0 {
            delta.bytes as f64 / seconds
        } else {
            0.0
        };

        Self {
            bytes: delta.bytes,
            packets: delta.packets,
            packet_loss: delta.packets_lost,
            packet_loss_rate,
            bytes_per_second,
            tracks,
        }
    }
}

/// Inbound and outbound traffic measured between two stats samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub inbound: DirectionReport,
    pub outbound: DirectionReport,
    /// Time between the two samples in milliseconds
    pub duration_ms: u64,
}

impl ConnectionReport {
    pub(crate) fn between(
        start: &TransportStats,
        end: &TransportStats,
        window: Duration,
        transceivers: &[TransceiverInfo],
    ) -> Self {
        let (inbound_tracks, outbound_tracks) = live_tracks(transceivers);
        Self {
            inbound: DirectionReport::new(end.inbound.since(&start.inbound), window, inbound_tracks),
            outbound: DirectionReport::new(
                end.outbound.since(&start.outbound),
                window,
                outbound_tracks,
            ),
            duration_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Count live (received, sent) tracks on transceivers that carry media
fn live_tracks(transceivers: &[TransceiverInfo]) -> (usize, usize) {
    let receiving = transceivers
        .iter()
        .filter(|t| t.direction.receives())
        .filter(|t| t.receiver_track.as_ref().is_some_and(|track| track.is_live()))
        .count();
    let sending = transceivers
        .iter()
        .filter(|t| t.direction.sends())
        .filter(|t| t.sender_track.as_ref().is_some_and(|track| track.is_live()))
        .count();
    (receiving, sending)
}

/// Point-in-time view of a session, suitable for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub local: PeerId,
    pub peer: PeerId,
    pub polite: bool,
    pub phase: NegotiationPhase,
    pub ice: IceConnectionState,
    pub offering: bool,
    pub closed: bool,
    pub local_tracks: usize,
    pub remote_tracks: usize,
    pub remote_streams: Vec<StreamId>,
    pub stats: TransportStats,
    pub captured_at: DateTime<Utc>,
}

impl PeerSession {
    /// Sample transport counters twice, `watch` apart, and report the
    /// difference
    pub async fn report(&self, watch: Duration) -> Result<ConnectionReport> {
        let transport = self.transport();
        let start = transport.stats().await?;
        let started = tokio::time::Instant::now();
        tokio::time::sleep(watch).await;
        let end = transport.stats().await?;

        Ok(ConnectionReport::between(
            &start,
            &end,
            started.elapsed(),
            &transport.transceivers(),
        ))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let stats = self.transport().stats().await?;
        Ok(SessionSnapshot {
            local: self.local_name().clone(),
            peer: self.peer().clone(),
            polite: self.is_polite(),
            phase: self.phase(),
            ice: self.transport().ice_connection_state(),
            offering: self.is_offering(),
            closed: self.is_closed(),
            local_tracks: self.local_tracks().len(),
            remote_tracks: self.shared.remote_tracks.read().len(),
            remote_streams: self
                .shared
                .remote_streams
                .read()
                .iter()
                .filter(|stream| stream.is_active())
                .map(|stream| stream.id().clone())
                .collect(),
            stats,
            captured_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use crate::signaling::MockSignalingLink;
    use crate::transport::memory::MemoryTransport;
    use std::sync::Arc;

    fn session(transport: Arc<MemoryTransport>) -> PeerSession {
        let mut signaling = MockSignalingLink::new();
        signaling.expect_send().returning(|_| Ok(()));
        PeerSession::spawn(
            PeerId::from("alice"),
            PeerId::from("bob"),
            transport,
            Arc::new(signaling),
            SessionOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_loss_rate_counts_lost_against_expected() {
        let delta = RtpCounters {
            bytes: 9_000,
            packets: 90,
            packets_lost: 10,
        };
        let report = DirectionReport::new(delta, Duration::from_secs(2), 1);
        assert!((report.packet_loss_rate - 0.1).abs() < f32::EPSILON);
        assert!((report.bytes_per_second - 4_500.0).abs() < f64::EPSILON);

        let idle = DirectionReport::new(RtpCounters::default(), Duration::ZERO, 0);
        assert_eq!(idle.packet_loss_rate, 0.0);
        assert_eq!(idle.bytes_per_second, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_measures_traffic_during_the_window() {
        let transport = MemoryTransport::new();
        // Traffic before the window is not part of the report
        transport.simulate_traffic(
            RtpCounters {
                bytes: 50_000,
                packets: 500,
                packets_lost: 5,
            },
            RtpCounters::default(),
        );
        let session = session(Arc::clone(&transport));

        let during = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                transport.simulate_traffic(
                    RtpCounters {
                        bytes: 12_000,
                        packets: 95,
                        packets_lost: 5,
                    },
                    RtpCounters {
                        bytes: 3_000,
                        packets: 30,
                        packets_lost: 0,
                    },
                );
            })
        };

        let report = session.report(Duration::from_secs(1)).await.unwrap();
        during.await.unwrap();

        assert_eq!(report.duration_ms, 1_000);
        assert_eq!(report.inbound.bytes, 12_000);
        assert_eq!(report.inbound.packets, 95);
        assert_eq!(report.inbound.packet_loss, 5);
        assert!((report.inbound.packet_loss_rate - 0.05).abs() < 1e-6);
        assert_eq!(report.outbound.packets, 30);
        assert!((report.outbound.bytes_per_second - 3_000.0).abs() < 1e-6);
        assert_eq!((report.inbound.tracks, report.outbound.tracks), (0, 0));
        session.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_serializes_session_state() {
        let transport = MemoryTransport::new();
        transport.simulate_traffic(
            RtpCounters {
                bytes: 100,
                packets: 1,
                packets_lost: 0,
            },
            RtpCounters::default(),
        );
        let session = session(transport);

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.peer, PeerId::from("bob"));
        assert!(!snapshot.polite);
        assert_eq!(snapshot.phase, NegotiationPhase::Stable);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["local"], "alice");
        assert_eq!(json["phase"], "stable");
        assert_eq!(json["ice"], "new");
        assert_eq!(json["stats"]["inbound"]["bytes"], 100);
        session.close().await;
    }
}
