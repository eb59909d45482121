//! In-memory signaling router
//!
//! Plays the part of the signaling server for a single room:
//! - announces joins and leaves (`user:connected`, `user:disconnected`)
//! - hands each new member the roster (`user:list`) and current topology
//! - stamps `sender` and routes addressed messages, broadcasts the rest
//! - serves `architecture:switch` requests addressed to `@server`

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{kinds, Signal, SignalEnvelope, SignalingLink, SERVER};
use crate::error::{Error, Result};
use crate::topology::Topology;
use crate::types::PeerId;

/// Message sender for a member connection
pub type MessageSender = mpsc::UnboundedSender<SignalEnvelope>;

#[derive(Debug, Clone)]
struct Member {
    connection_id: String,
    sender: MessageSender,
}

struct HubInner {
    members: DashMap<PeerId, Member>,
    topology: RwLock<Topology>,
}

#[derive(Clone)]
pub struct SignalingHub {
    inner: Arc<HubInner>,
}

impl SignalingHub {
    #[must_use]
    pub fn new(topology: Topology) -> Self {
        Self {
            inner: Arc::new(HubInner {
                members: DashMap::new(),
                topology: RwLock::new(topology),
            }),
        }
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        *self.inner.topology.read()
    }

    /// Current members, sorted by name
    #[must_use]
    pub fn members(&self) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .inner
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        members.sort();
        members
    }

    /// Join the room under `peer`, replacing any previous connection with that name
    pub fn join(&self, peer: PeerId) -> (HubLink, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = nanoid::nanoid!();

        let others: Vec<PeerId> = self
            .members()
            .into_iter()
            .filter(|member| *member != peer)
            .collect();

        let replaced = self.inner.members.insert(
            peer.clone(),
            Member {
                connection_id: connection_id.clone(),
                sender: tx.clone(),
            },
        );
        if replaced.is_none() {
            self.broadcast(
                Some(&peer),
                server_envelope(kinds::USER_CONNECTED, json!(peer.as_str())),
            );
        }

        let topology = self.topology();
        let greeting = [
            SignalEnvelope::topology_switch(Some(peer.clone()), Some(topology.as_str()))
                .from_sender(PeerId::from(SERVER)),
            server_envelope(kinds::USER_LIST, json!(others)),
        ];
        for envelope in greeting {
            let _ = tx.send(envelope);
        }

        info!(
            peer = %peer,
            members = others.len() + 1,
            rejoined = replaced.is_some(),
            "Member joined"
        );

        (
            HubLink {
                hub: self.clone(),
                peer,
                connection_id,
            },
            rx,
        )
    }

    /// Remove a member connection; stale connection ids are ignored
    pub fn leave(&self, peer: &PeerId, connection_id: &str) {
        let removed = self
            .inner
            .members
            .remove_if(peer, |_, member| member.connection_id == connection_id);

        if removed.is_some() {
            info!(peer = %peer, "Member left");
            self.broadcast(
                Some(peer),
                server_envelope(kinds::USER_DISCONNECTED, json!(peer.as_str())),
            );
        } else {
            debug!(peer = %peer, "Ignoring leave for replaced or unknown connection");
        }
    }

    /// Route a message sent by `from`, returning the number of recipients
    pub fn route(&self, from: &PeerId, envelope: SignalEnvelope) -> Result<usize> {
        let envelope = envelope.from_sender(from.clone());

        if envelope.kind.starts_with("user:") {
            return Err(Error::Signaling(format!(
                "{} is reserved for the server",
                envelope.kind
            )));
        }

        match envelope.receiver.as_ref().map(PeerId::as_str) {
            Some(SERVER) => self.serve(from, &envelope),
            Some(name) if name != "*" => {
                let receiver = PeerId::from(name);
                let sender = self
                    .inner
                    .members
                    .get(&receiver)
                    .map(|member| member.sender.clone())
                    .ok_or_else(|| Error::NotFound(format!("{receiver} is away")))?;
                sender
                    .send(envelope)
                    .map_err(|_| Error::Closed(format!("connection to {receiver}")))?;
                Ok(1)
            }
            _ => Ok(self.broadcast(Some(from), envelope)),
        }
    }

    /// Requests addressed to the server itself
    fn serve(&self, from: &PeerId, envelope: &SignalEnvelope) -> Result<usize> {
        match envelope.signal()? {
            Signal::TopologySwitch(Some(name)) => {
                let topology = name.parse::<Topology>()?;
                *self.inner.topology.write() = topology;
                info!(requested_by = %from, topology = %topology, "Topology switched");
                Ok(self.broadcast(
                    None,
                    SignalEnvelope::topology_switch(None, Some(topology.as_str()))
                        .from_sender(PeerId::from(SERVER)),
                ))
            }
            Signal::TopologySwitch(None) => {
                let reply =
                    SignalEnvelope::topology_switch(Some(from.clone()), Some(self.topology().as_str()))
                        .from_sender(PeerId::from(SERVER));
                self.route_from_server(from, reply)
            }
            _ => Err(Error::Signaling(format!(
                "server does not handle {}",
                envelope.kind
            ))),
        }
    }

    fn route_from_server(&self, to: &PeerId, envelope: SignalEnvelope) -> Result<usize> {
        let member = self
            .inner
            .members
            .get(to)
            .map(|member| member.sender.clone())
            .ok_or_else(|| Error::NotFound(format!("{to} is away")))?;
        member
            .send(envelope)
            .map_err(|_| Error::Closed(format!("connection to {to}")))?;
        Ok(1)
    }

    /// Send to every member except `exclude`, dropping dead connections
    pub fn broadcast(&self, exclude: Option<&PeerId>, envelope: SignalEnvelope) -> usize {
        let mut sent_count = 0;
        let mut failed = Vec::new();

        for entry in self.inner.members.iter() {
            if exclude == Some(entry.key()) {
                continue;
            }
            if entry.value().sender.send(envelope.clone()).is_ok() {
                sent_count += 1;
            } else {
                warn!(
                    peer = %entry.key(),
                    kind = %envelope.kind,
                    "Failed to deliver to member, marking for cleanup"
                );
                failed.push((entry.key().clone(), entry.value().connection_id.clone()));
            }
        }

        for (peer, connection_id) in failed {
            self.inner
                .members
                .remove_if(&peer, |_, member| member.connection_id == connection_id);
        }

        debug!(kind = %envelope.kind, recipients = sent_count, "Broadcast");
        sent_count
    }
}

fn server_envelope(kind: &str, data: serde_json::Value) -> SignalEnvelope {
    SignalEnvelope::new(kind, None, data).from_sender(PeerId::from(SERVER))
}

/// A member's outbound link into the hub
#[derive(Clone)]
pub struct HubLink {
    hub: SignalingHub,
    peer: PeerId,
    connection_id: String,
}

impl HubLink {
    #[must_use]
    pub const fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn leave(&self) {
        self.hub.leave(&self.peer, &self.connection_id);
    }
}

impl SignalingLink for HubLink {
    fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.hub.route(&self.peer, envelope).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescription;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SignalEnvelope>) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            signals.push(envelope.signal().unwrap());
        }
        signals
    }

    #[test]
    fn test_join_announces_and_sends_roster() {
        let hub = SignalingHub::new(Topology::Mesh);
        let (_alice, mut alice_rx) = hub.join(PeerId::from("alice"));
        let (_bob, mut bob_rx) = hub.join(PeerId::from("bob"));

        assert_eq!(
            drain(&mut alice_rx),
            vec![
                Signal::TopologySwitch(Some("mesh".to_string())),
                Signal::UserList(vec![]),
                Signal::UserConnected(PeerId::from("bob")),
            ]
        );
        assert_eq!(
            drain(&mut bob_rx),
            vec![
                Signal::TopologySwitch(Some("mesh".to_string())),
                Signal::UserList(vec![PeerId::from("alice")]),
            ]
        );
    }

    #[test]
    fn test_route_stamps_sender_and_delivers() {
        let hub = SignalingHub::new(Topology::Mesh);
        let (alice, _alice_rx) = hub.join(PeerId::from("alice"));
        let (_bob, mut bob_rx) = hub.join(PeerId::from("bob"));
        drain(&mut bob_rx);

        let offer = SignalEnvelope::sdp(&PeerId::from("bob"), &SessionDescription::offer("v=0"))
            .unwrap();
        alice.send(offer).unwrap();

        let delivered = bob_rx.try_recv().unwrap();
        assert_eq!(delivered.sender, Some(PeerId::from("alice")));
        assert_eq!(delivered.kind, kinds::SDP);
    }

    #[test]
    fn test_route_to_absent_member_fails() {
        let hub = SignalingHub::new(Topology::Mesh);
        let (alice, _rx) = hub.join(PeerId::from("alice"));

        let result = alice.send(SignalEnvelope::connection_close(&PeerId::from("zed")));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_clients_cannot_forge_membership() {
        let hub = SignalingHub::new(Topology::Mesh);
        let (alice, _rx) = hub.join(PeerId::from("alice"));

        let forged = SignalEnvelope::new(kinds::USER_DISCONNECTED, None, json!("bob"));
        assert!(matches!(alice.send(forged), Err(Error::Signaling(_))));
    }

    #[test]
    fn test_topology_switch_request_is_validated_and_broadcast() {
        let hub = SignalingHub::new(Topology::Mesh);
        let (alice, mut alice_rx) = hub.join(PeerId::from("alice"));
        let (_bob, mut bob_rx) = hub.join(PeerId::from("bob"));
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let bad = SignalEnvelope::topology_switch(Some(PeerId::from(SERVER)), Some("ring"));
        assert!(matches!(alice.send(bad), Err(Error::InvalidTopology(_))));
        assert_eq!(hub.topology(), Topology::Mesh);

        let good = SignalEnvelope::topology_switch(Some(PeerId::from(SERVER)), Some("SFU"));
        alice.send(good).unwrap();
        assert_eq!(hub.topology(), Topology::Sfu);
        for rx in [&mut alice_rx, &mut bob_rx] {
            assert_eq!(
                drain(rx),
                vec![Signal::TopologySwitch(Some("sfu".to_string()))]
            );
        }
    }

    #[test]
    fn test_leave_broadcasts_and_ignores_stale_connections() {
        let hub = SignalingHub::new(Topology::Mesh);
        let (alice, mut alice_rx) = hub.join(PeerId::from("alice"));
        let (stale_bob, _stale_rx) = hub.join(PeerId::from("bob"));
        let (bob, _bob_rx) = hub.join(PeerId::from("bob"));
        drain(&mut alice_rx);

        stale_bob.leave();
        assert_eq!(hub.members().len(), 2);

        bob.leave();
        assert_eq!(hub.members(), vec![PeerId::from("alice")]);
        assert_eq!(
            drain(&mut alice_rx),
            vec![Signal::UserDisconnected(PeerId::from("bob"))]
        );
        drop(alice);
    }
}
