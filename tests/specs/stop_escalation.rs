// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stopping a process that ignores graceful termination escalates to a
//! forced kill within a bounded time.

use super::common::daemon_config;
use brum_core::{Event, Topic};
use brum_daemon::lifecycle;
use brum_supervisor::ProcessStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn stubborn_process_is_killed_and_reports_once() {
    let state = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let daemon = lifecycle::startup(daemon_config(
        state.path(),
        work.path(),
        "e2e",
        false,
        (26_200, 26_299),
    ))
    .await
    .unwrap();

    let exits = Arc::new(counter::Counter::default());
    let sink = Arc::clone(&exits);
    daemon.bus.subscribe(
        Topic::ProcessExited,
        Arc::new(move |_event: &Event| {
            sink.increment();
        }),
    );

    let process = daemon
        .supervisor
        .start_command(
            "stubborn",
            "sh",
            &["-c".to_string(), "trap '' TERM; sleep 120".to_string()],
            &[],
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let graceful = Duration::from_millis(400);
    let started = Instant::now();
    let stopped = daemon.supervisor.stop_process(process.id.as_str()).await.unwrap();
    assert!(started.elapsed() <= graceful * 4, "stop took {:?}", started.elapsed());
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert!(stopped.exit_code.is_some());

    // Exactly one exit event.
    for _ in 0..100 {
        if exits.get() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exits.get(), 1);

    daemon.shutdown().await;
}

/// Tiny atomic counter shared with the bus subscription.
mod counter {
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct Counter(AtomicUsize);

    impl Counter {
        pub fn increment(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        pub fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }
}
