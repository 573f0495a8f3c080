//! Peer-to-peer change-log synchronization.
//!
//! Leaves first: [`codec`] and [`scope`] are pure; [`change_log`],
//! [`delivery`], [`stream`] and [`conflict`] own their tables; [`apply`]
//! mutates the store; [`session`], [`transport`] and [`client`] speak the
//! protocol.

pub mod apply;
pub mod change_log;
pub mod client;
pub mod codec;
pub mod conflict;
pub mod delivery;
pub mod scope;
pub mod session;
pub mod stream;
pub mod transport;
pub mod wire;
