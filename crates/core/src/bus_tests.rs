// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::atomic::AtomicUsize;

fn collect_into(sink: Arc<Mutex<Vec<Event>>>) -> Handler {
    Arc::new(move |event: &Event| {
        sink.lock().push(event.clone());
    })
}

async fn settle(bus: &EventBus) {
    // Workers drain asynchronously; poll until the queues are empty.
    for _ in 0..100 {
        if bus.metrics().queue_depth == 0 {
            // One extra yield so the in-flight dispatch completes.
            tokio::task::yield_now().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn delivers_in_publish_order_within_topic() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(Topic::LogLine, collect_into(Arc::clone(&seen)));

    for i in 0..50 {
        bus.publish(Event::new(Topic::LogLine).with("seq", i)).await.unwrap();
    }
    settle(&bus).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 50);
    for (i, event) in seen.iter().enumerate() {
        assert_eq!(event.payload.get("seq").and_then(|v| v.as_u64()), Some(i as u64));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_priority_overflow_drops_oldest() {
    let bus = EventBus::with_queue_cap(4);
    // The handler blocks on the gate, so the queue fills past capacity.
    let gate = Arc::new(Mutex::new(()));
    let blocker = gate.lock();
    let gate2 = Arc::clone(&gate);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    bus.subscribe(
        Topic::LogLine,
        Arc::new(move |event: &Event| {
            let _held = gate2.lock();
            seen2.lock().push(event.clone());
        }),
    );

    // First event occupies the worker (blocked on the gate); the rest fill
    // the queue beyond capacity.
    for i in 0..8 {
        bus.publish(Event::new(Topic::LogLine).with("seq", i)).await.unwrap();
    }
    assert!(bus.metrics().dropped > 0);
    drop(blocker);
    settle(&bus).await;

    let seen = seen.lock();
    // The newest event always survives drop-oldest.
    assert_eq!(seen.last().and_then(|e| e.payload.get("seq")).and_then(|v| v.as_u64()), Some(7));
}

#[tokio::test]
async fn handler_panic_does_not_affect_siblings() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    let internal = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(Topic::InternalError, collect_into(Arc::clone(&internal)));

    bus.subscribe(
        Topic::ProcessStarted,
        Arc::new(|_event: &Event| panic!("handler bug")),
    );
    bus.subscribe(
        Topic::ProcessStarted,
        Arc::new(move |_event: &Event| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }),
    );

    bus.publish(Event::new(Topic::ProcessStarted)).await.unwrap();
    settle(&bus).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.metrics().handler_panics, 1);

    // The panic is also reported as an internal error event.
    for _ in 0..100 {
        if !internal.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let internal = internal.lock();
    assert_eq!(internal.len(), 1);
    assert_eq!(internal[0].str_field("kind"), Some("handler_panic"));
    assert_eq!(internal[0].str_field("topic"), Some("process.started"));
}

#[tokio::test]
async fn internal_error_handler_panic_does_not_recurse() {
    let bus = EventBus::new();
    bus.subscribe(
        Topic::InternalError,
        Arc::new(|_event: &Event| panic!("reporter bug")),
    );
    bus.subscribe(
        Topic::ProcessStarted,
        Arc::new(|_event: &Event| panic!("handler bug")),
    );

    bus.publish(Event::new(Topic::ProcessStarted)).await.unwrap();
    settle(&bus).await;

    // One panic from the origin handler, one from the internal.error
    // handler it triggered; the second produces no further report.
    for _ in 0..100 {
        if bus.metrics().handler_panics == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(bus.metrics().handler_panics, 2);
    assert_eq!(bus.metrics().queue_depth, 0);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sub = bus.subscribe(Topic::LogLine, collect_into(Arc::clone(&seen)));

    bus.publish(Event::new(Topic::LogLine).with("seq", 0)).await.unwrap();
    settle(&bus).await;
    bus.unsubscribe(&sub);
    bus.publish(Event::new(Topic::LogLine).with("seq", 1)).await.unwrap();
    settle(&bus).await;

    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn publish_after_shutdown_errors() {
    let bus = EventBus::new();
    bus.subscribe(Topic::LogLine, Arc::new(|_e: &Event| {}));
    bus.shutdown(Duration::from_secs(1)).await;
    let result = bus.publish(Event::new(Topic::LogLine)).await;
    assert!(matches!(result, Err(BusError::Shutdown)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_cross_topic_blocking() {
    let bus = EventBus::new();
    let (slow_tx, _slow_rx) = std::sync::mpsc::channel::<()>();
    bus.subscribe(
        Topic::McpActivity,
        Arc::new(move |_event: &Event| {
            // Simulate a slow handler on one topic.
            let _ = slow_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(Topic::ProcessExited, collect_into(Arc::clone(&seen)));

    bus.publish(Event::new(Topic::McpActivity)).await.unwrap();
    bus.publish(Event::new(Topic::ProcessExited)).await.unwrap();

    // The process.exited delivery must not wait for the slow topic.
    for _ in 0..50 {
        if !seen.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.lock().len(), 1);
}
