// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! brum-hub: multi-instance coordination
//!
//! Running Brummer instances advertise themselves through a filesystem
//! rendezvous directory; a hub watches it, keeps one connection actor per
//! peer, and exposes every peer's RPC tools behind a single namespaced
//! dispatch surface.

pub mod client;
pub mod manager;
pub mod rendezvous;
pub mod router;

#[cfg(test)]
mod test_peer;

pub use client::{HubError, RpcClient, ToolInfo};
pub use manager::{ConnectionInfo, ConnectionState, HubConfig, HubManager};
pub use rendezvous::{
    InstanceRecord, InstanceRegistration, ProcessInfo, RendezvousConfig, RendezvousError,
    RendezvousEvent, RendezvousWatcher,
};
pub use router::{split_tool_name, HubRouter};
