use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded as channel};
use serde::Serialize;

use crate::error::GpioError;
use crate::gpio::{Level, Pin};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EdgeEvent {
    pub line: u32,
    pub level: Level,
    pub timestamp_ms: u64,
}

impl EdgeEvent {
    /// An event for `line` stamped with the current wall-clock time.
    pub fn now(line: u32, level: Level) -> Self {
        Self {
            line,
            level,
            timestamp_ms: epoch_millis(),
        }
    }
}

/// Creates a queue holding up to `capacity` events.
///
/// A capacity of zero makes a rendezvous queue: each push waits until the
/// consumer takes the event, which holds up the watcher's dispatch thread
/// meanwhile. Buffered queues never wait and drop events once full.
pub fn bounded(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = channel(capacity);
    (
        EventSink {
            tx,
            rendezvous: capacity == 0,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventStream { rx },
    )
}

/// Producer side, fed from watcher handlers.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<EdgeEvent>,
    rendezvous: bool,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn push(&self, event: EdgeEvent) {
        if self.rendezvous {
            if self.tx.send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("event queue full, dropping edge on gpio{}", event.line);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// A handler that samples the pin level and queues it as an event.
    pub fn handler(&self) -> impl Fn(&Pin) + Send + Sync + 'static {
        let sink = self.clone();
        move |pin: &Pin| match pin.read() {
            Ok(level) => sink.push(EdgeEvent::now(pin.line(), level)),
            Err(e) => warn!("gpio{}: read after edge failed: {e}", pin.line()),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct EventStream {
    rx: Receiver<EdgeEvent>,
}

impl EventStream {
    pub fn recv(&self) -> Result<EdgeEvent, GpioError> {
        self.rx.recv().map_err(|_| GpioError::Closed)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<EdgeEvent, GpioError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => {
                GpioError::Timeout(format!("no edge within {}ms", timeout.as_millis()))
            }
            RecvTimeoutError::Disconnected => GpioError::Closed,
        })
    }

    pub fn try_recv(&self) -> Option<EdgeEvent> {
        self.rx.try_recv().ok()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
