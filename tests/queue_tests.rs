use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gpiowatch::queue::{self, EdgeEvent};
use gpiowatch::{Edge, GpioBackend, GpioError, Level, MockGpioBackend, Mode, Pin, Watcher};

#[test]
fn full_queue_drops_and_counts() {
    let (sink, events) = queue::bounded(1);
    sink.push(EdgeEvent::now(1, Level::High));
    sink.push(EdgeEvent::now(1, Level::Low));

    assert_eq!(sink.dropped(), 1);
    assert_eq!(events.try_recv().map(|e| e.level), Some(Level::High));
    assert!(events.try_recv().is_none());
}

#[test]
fn recv_timeout_reports_timeout_error() {
    let (_sink, events) = queue::bounded(4);
    let err = events.recv_timeout(Duration::from_millis(5)).unwrap_err();
    assert!(matches!(err, GpioError::Timeout(_)), "got {err}");
}

#[test]
fn closed_queue_reports_closed() {
    let (sink, events) = queue::bounded(4);
    drop(sink);
    assert!(matches!(events.recv(), Err(GpioError::Closed)));
}

#[test]
fn rendezvous_queue_hands_edge_to_late_receiver() {
    let backend = Arc::new(MockGpioBackend::default());
    backend.jumper(30, 31);
    let shared: Arc<dyn GpioBackend> = backend.clone();
    let pin_in = Pin::new(30, shared.clone());
    let pin_out = Pin::new(31, shared);
    pin_in.set_mode(Mode::Input).unwrap();
    pin_out.write(Level::Low).unwrap();
    pin_out.set_mode(Mode::Output).unwrap();

    let watcher = Watcher::start().unwrap();
    let (sink, events) = queue::bounded(0);
    watcher
        .register_pin(&pin_in, Edge::Rising, sink.handler())
        .unwrap();

    pin_out.high().unwrap();
    // nobody is receiving yet; the handler waits for us
    thread::sleep(Duration::from_millis(5));

    let event = events.recv_timeout(Duration::from_millis(500)).unwrap();
    assert_eq!(event.line, 30);
    assert_eq!(event.level, Level::High);
    assert_eq!(sink.dropped(), 0);

    watcher.unregister_pin(&pin_in);
}

#[test]
fn rendezvous_push_without_receiver_is_dropped() {
    let (sink, events) = queue::bounded(0);
    drop(events);
    sink.push(EdgeEvent::now(3, Level::High));
    assert_eq!(sink.dropped(), 1);
}

#[test]
fn handler_samples_pin_level() {
    let backend: Arc<dyn GpioBackend> = Arc::new(MockGpioBackend::default());
    let pin = Pin::new(12, backend);
    let (sink, events) = queue::bounded(4);
    let handler = sink.handler();

    handler(&pin);
    let event = events.try_recv().expect("event queued");
    assert_eq!(event.line, 12);
    assert_eq!(event.level, Level::Low);
}

#[test]
fn event_serializes_as_json() {
    let event = EdgeEvent {
        line: 4,
        level: Level::High,
        timestamp_ms: 1700000000000,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["line"], 4);
    assert_eq!(json["level"], "high");
    assert_eq!(json["timestamp_ms"], 1700000000000u64);
}
