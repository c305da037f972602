// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TCP port allocation for the proxy fleet

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in range {0}-{1}")]
    Exhausted(u16, u16),
}

/// Walks a configured range, skipping ports that are already handed out or
/// fail a test bind. Released ports become immediately re-allocatable.
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Inclusive range.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end, allocated: Mutex::new(HashSet::new()) }
    }

    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut allocated = self.allocated.lock();
        for port in self.start..=self.end {
            if allocated.contains(&port) {
                continue;
            }
            // Test bind: something outside our bookkeeping may own the port.
            if TcpListener::bind(("127.0.0.1", port)).is_err() {
                continue;
            }
            allocated.insert(port);
            return Ok(port);
        }
        Err(PortError::Exhausted(self.start, self.end))
    }

    pub fn release(&self, port: u16) {
        self.allocated.lock().remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.allocated.lock().len()
    }
}

#[cfg(test)]
#[path = "ports_tests.rs"]
mod tests;
