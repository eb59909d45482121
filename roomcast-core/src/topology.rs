//! Connection topology selection
//!
//! - `mesh`: every participant connects to every other participant
//! - `sfu`: everyone connects to a forwarding server (`@sfu`)
//! - `mcu`: everyone connects to a mixing server (`@mcu`)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::events::EventEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    #[default]
    Mesh,
    Sfu,
    Mcu,
}

impl Topology {
    /// Circular transition order
    pub const ORDER: [Self; 3] = [Self::Mesh, Self::Sfu, Self::Mcu];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mesh => "mesh",
            Self::Sfu => "sfu",
            Self::Mcu => "mcu",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Mesh => 0,
            Self::Sfu => 1,
            Self::Mcu => 2,
        }
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self::ORDER[(self.index() + 1) % Self::ORDER.len()]
    }

    #[must_use]
    pub const fn previous(self) -> Self {
        Self::ORDER[(self.index() + Self::ORDER.len() - 1) % Self::ORDER.len()]
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mesh" => Ok(Self::Mesh),
            "sfu" => Ok(Self::Sfu),
            "mcu" => Ok(Self::Mcu),
            _ => Err(Error::InvalidTopology(format!(
                "{s:?} is not one of mesh, sfu, mcu"
            ))),
        }
    }
}

/// What caused a topology transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchCause {
    Next,
    Previous,
    Set,
}

/// Raised on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologySwitched {
    pub current: Topology,
    pub previous: Topology,
    pub cause: SwitchCause,
}

/// Holds the active topology and notifies on transitions
#[derive(Debug, Default)]
pub struct TopologySelector {
    current: RwLock<Topology>,
    events: EventEmitter<TopologySwitched>,
}

impl TopologySelector {
    #[must_use]
    pub fn new(initial: Topology) -> Self {
        Self {
            current: RwLock::new(initial),
            events: EventEmitter::new(),
        }
    }

    #[must_use]
    pub fn current(&self) -> Topology {
        *self.current.read()
    }

    /// Peek at the value `next()` would switch to
    #[must_use]
    pub fn next_value(&self) -> Topology {
        self.current().next()
    }

    /// Peek at the value `previous()` would switch to
    #[must_use]
    pub fn previous_value(&self) -> Topology {
        self.current().previous()
    }

    pub fn next(&self) -> Topology {
        self.transition(SwitchCause::Next, Topology::next)
    }

    pub fn previous(&self) -> Topology {
        self.transition(SwitchCause::Previous, Topology::previous)
    }

    /// Switch by name, case-insensitively; unknown names leave the value untouched
    pub fn set(&self, name: &str) -> Result<Topology> {
        let topology = name.parse::<Topology>()?;
        Ok(self.set_topology(topology))
    }

    pub fn set_topology(&self, topology: Topology) -> Topology {
        self.transition(SwitchCause::Set, |_| topology)
    }

    #[must_use]
    pub const fn events(&self) -> &EventEmitter<TopologySwitched> {
        &self.events
    }

    fn transition(&self, cause: SwitchCause, step: impl FnOnce(Topology) -> Topology) -> Topology {
        let (previous, current) = {
            let mut value = self.current.write();
            let previous = *value;
            *value = step(previous);
            (previous, *value)
        };

        tracing::debug!(%previous, %current, ?cause, "Topology switched");
        self.events.emit(TopologySwitched {
            current,
            previous,
            cause,
        });
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_next_previous_are_inverse() {
        for topology in Topology::ORDER {
            assert_eq!(topology.previous().next(), topology);
            assert_eq!(topology.next().previous(), topology);
        }
    }

    #[test]
    fn test_peeking_does_not_switch() {
        let selector = TopologySelector::new(Topology::Mesh);
        assert_eq!(selector.previous_value(), Topology::Mcu);
        assert_eq!(selector.next_value(), Topology::Sfu);
        assert_eq!(selector.current(), Topology::Mesh);

        let peeked = selector.previous_value();
        assert_eq!(selector.previous(), peeked);
        assert_eq!(selector.previous_value(), Topology::Sfu);
        assert_eq!(selector.current(), Topology::Mcu);
    }

    #[test]
    fn test_circular_order() {
        assert_eq!(Topology::Mesh.next(), Topology::Sfu);
        assert_eq!(Topology::Sfu.next(), Topology::Mcu);
        assert_eq!(Topology::Mcu.next(), Topology::Mesh);
        assert_eq!(Topology::Mesh.previous(), Topology::Mcu);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("SFU".parse::<Topology>().unwrap(), Topology::Sfu);
        assert_eq!(" Mesh ".parse::<Topology>().unwrap(), Topology::Mesh);
        assert!(matches!(
            "ring".parse::<Topology>(),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_selector_transitions_emit_events() {
        let selector = TopologySelector::new(Topology::Mesh);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        selector.events().on(move |event| sink.lock().push(*event));

        assert_eq!(selector.next_value(), Topology::Sfu);
        assert_eq!(selector.next(), Topology::Sfu);
        assert_eq!(selector.previous(), Topology::Mesh);
        assert_eq!(selector.set("MCU").unwrap(), Topology::Mcu);

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[0],
            TopologySwitched {
                current: Topology::Sfu,
                previous: Topology::Mesh,
                cause: SwitchCause::Next,
            }
        );
        assert_eq!(seen[1].cause, SwitchCause::Previous);
        assert_eq!(seen[2].current, Topology::Mcu);
        assert_eq!(seen[2].previous, Topology::Mesh);
    }

    #[test]
    fn test_invalid_set_keeps_value_and_is_silent() {
        let selector = TopologySelector::new(Topology::Sfu);
        let mut rx = selector.events().subscribe();

        assert!(selector.set("p2p").is_err());
        assert_eq!(selector.current(), Topology::Sfu);
        assert!(rx.try_recv().is_err());
    }
}
