//! Roomcast conferencing
//!
//! Ties the negotiation core and the mixers together: a [`Conference`] is
//! one participant that follows the room's topology, and the hubs are the
//! forwarding and mixing servers it talks to under `sfu` and `mcu`.

pub mod conference;
pub mod hub;

pub use conference::{Conference, MCU_PEER, SFU_PEER};
pub use hub::{McuHub, SfuHub};
