// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Brummer daemon library
//!
//! Exposes the daemon's configuration, lifecycle wiring, and RPC listener
//! for the `brumd` binary and integration tests.

pub mod env;
pub mod lifecycle;
pub mod rpc;

pub use lifecycle::{Config, Daemon, LifecycleError};
pub use rpc::InstanceRpc;
