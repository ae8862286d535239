//! Relay control/data plane: the ten components described in §2 of the
//! design, wired together by [`coordinator::Coordinator`]. This crate has
//! no knowledge of any concrete signaling transport or upstream SFU client —
//! it depends only on the `Signaling` trait (and, for the Bridge, the
//! `SfuClient` trait below) from `relay-protocol`.

pub mod bridge;
pub mod buffer_pool;
pub mod coordinator;
pub mod election;
pub mod failover;
pub mod keepalive;
pub mod probe;
pub mod relay_room;
pub mod stats;
pub mod switcher;

pub use bridge::*;
pub use buffer_pool::*;
pub use coordinator::*;
pub use election::*;
pub use failover::*;
pub use keepalive::*;
pub use probe::*;
pub use relay_room::*;
pub use stats::*;
pub use switcher::*;
