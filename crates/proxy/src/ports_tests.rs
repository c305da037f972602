// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn allocates_distinct_ports() {
    let allocator = PortAllocator::new(29_500, 29_509);
    let a = allocator.allocate().unwrap();
    let b = allocator.allocate().unwrap();
    assert_ne!(a, b);
    assert_eq!(allocator.in_use(), 2);
}

#[test]
fn release_makes_port_reusable() {
    let allocator = PortAllocator::new(29_510, 29_512);
    let a = allocator.allocate().unwrap();
    let b = allocator.allocate().unwrap();
    let c = allocator.allocate().unwrap();
    assert!(allocator.allocate().is_err());
    allocator.release(b);
    assert_eq!(allocator.allocate().unwrap(), b);
    allocator.release(a);
    allocator.release(c);
}

#[test]
fn skips_ports_bound_elsewhere() {
    let allocator = PortAllocator::new(29_520, 29_524);
    let blocker = TcpListener::bind(("127.0.0.1", 29_520));
    let port = allocator.allocate().unwrap();
    if blocker.is_ok() {
        assert_ne!(port, 29_520);
    }
    allocator.release(port);
    drop(blocker);
}

#[test]
fn exhaustion_reports_range() {
    let allocator = PortAllocator::new(29_531, 29_530);
    assert!(matches!(allocator.allocate(), Err(PortError::Exhausted(29_531, 29_530))));
}

#[test]
fn register_release_cycle_restores_state() {
    let allocator = PortAllocator::new(29_540, 29_549);
    let before = allocator.in_use();
    let port = allocator.allocate().unwrap();
    allocator.release(port);
    assert_eq!(allocator.in_use(), before);
}
