use log::{debug, error, info, warn};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::pipe2;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::config::WatcherConfig;
use crate::error::GpioError;
use crate::gpio::{Edge, NotificationSource, Pin};

const WATCHER_WAKE_TOKEN: u64 = 0;
const WATCHER_THREAD_NAME: &str = "gpio-watcher";

/// Callback invoked on the dispatch thread for every qualifying edge.
///
/// Handlers of all pins share one thread, so a slow handler delays delivery
/// for every other watched pin. Hand long work off elsewhere.
pub type Handler = Arc<dyn Fn(&Pin) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Running,
    Closing,
}

struct WatchEntry {
    pin: Pin,
    edge: Edge,
    handler: Handler,
    generation: u64,
    token: u64,
    source: Box<dyn NotificationSource>,
    armed: bool,
}

struct Registry {
    state: WatcherState,
    entries: FxHashMap<u32, WatchEntry>, // keyed by line
    tokens: FxHashMap<u64, u32>,         // epoll token -> line
}

struct Shared {
    epoll: Epoll,
    registry: Mutex<Registry>,
    // held by the dispatcher while it decides to start a handler
    delivery: Mutex<()>,
    closed: Condvar,
    wake_tx: Mutex<File>,
    next_token: AtomicU64,
    next_generation: AtomicU64,
    dispatch_thread: OnceLock<ThreadId>,
}

impl Shared {
    fn state(&self) -> WatcherState {
        self.registry.lock().state
    }

    fn on_dispatch_thread(&self) -> bool {
        self.dispatch_thread.get() == Some(&thread::current().id())
    }

    /// Waits out a delivery that checked the entry before the caller changed
    /// it but has not started its handler yet. Handlers already running are
    /// not waited for. Inside a handler there is nothing to wait for.
    fn await_delivery(&self) {
        if !self.on_dispatch_thread() {
            drop(self.delivery.lock());
        }
    }

    fn wake(&self) {
        if let Err(e) = self.wake_tx.lock().write_all(&[1]) {
            warn!("failed to wake gpio watcher: {e}");
        }
    }

    fn register(&self, pin: &Pin, edge: Edge, handler: Handler) -> Result<u64, GpioError> {
        let line = pin.line();
        let mut registry = self.registry.lock();
        if registry.state != WatcherState::Running {
            return Err(GpioError::Closed);
        }

        let backend = pin.backend();
        backend.export(line)?;
        backend.set_edge(line, edge)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = registry.entries.get_mut(&line) {
            entry.pin = pin.clone();
            entry.edge = edge;
            entry.handler = handler;
            entry.generation = generation;
            debug!("gpio{line}: replaced handler, edge {}", edge.as_sysfs());
            return Ok(generation);
        }

        let (token, source) = match self.add_source(pin) {
            Ok(v) => v,
            Err(e) => {
                let _ = backend.set_edge(line, Edge::None);
                return Err(e);
            }
        };
        let armed = !source.reports_on_arm();
        registry.tokens.insert(token, line);
        registry.entries.insert(
            line,
            WatchEntry {
                pin: pin.clone(),
                edge,
                handler,
                generation,
                token,
                source,
                armed,
            },
        );
        debug!("gpio{line}: watching edge {}", edge.as_sysfs());

        Ok(generation)
    }

    fn add_source(&self, pin: &Pin) -> Result<(u64, Box<dyn NotificationSource>), GpioError> {
        let source = pin.open_source()?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let interest = EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLET;
        self.epoll.add(source.as_fd(), EpollEvent::new(interest, token))?;
        Ok((token, source))
    }

    /// Removes the entry for `line`, or only the given generation of it.
    fn unregister(&self, line: u32, generation: Option<u64>) -> bool {
        let mut registry = self.registry.lock();
        let current = registry.entries.get(&line).map(|e| e.generation);
        match (current, generation) {
            (None, _) => return false,
            (Some(current), Some(wanted)) if current != wanted => return false,
            _ => {}
        }
        if let Some(entry) = registry.entries.remove(&line) {
            registry.tokens.remove(&entry.token);
            self.release(entry);
        }
        true
    }

    // must be called with the registry locked
    fn release(&self, entry: WatchEntry) {
        let line = entry.pin.line();
        if let Err(e) = self.epoll.delete(entry.source.as_fd()) {
            debug!("gpio{line}: removing source from wait set: {e}");
        }
        let backend = entry.pin.backend();
        if let Err(e) = backend.set_edge(line, Edge::None) {
            debug!("gpio{line}: resetting edge: {e}");
        }
        if let Err(e) = backend.unexport(line) {
            debug!("gpio{line}: unexport: {e}");
        }
        debug!("gpio{line}: released watch");
    }

    fn is_current(&self, line: u32, generation: u64) -> bool {
        let registry = self.registry.lock();
        registry.state == WatcherState::Running
            && registry.entries.get(&line).map(|e| e.generation) == Some(generation)
    }

    /// Checks that `generation` is still current and commits to starting its
    /// handler. Once this returns true the invocation counts as in flight.
    fn begin_delivery(&self, line: u32, generation: u64) -> bool {
        let _gate = self.delivery.lock();
        self.is_current(line, generation)
    }

    fn deliver(&self, token: u64) {
        let (pin, handler, generation, edges) = {
            let mut registry = self.registry.lock();
            if registry.state != WatcherState::Running {
                return;
            }
            let Some(&line) = registry.tokens.get(&token) else {
                debug!("ignoring event from released source {token}");
                return;
            };
            let Some(entry) = registry.entries.get_mut(&line) else {
                return;
            };

            let mut edges = match entry.source.acknowledge() {
                Ok(n) => n,
                Err(e) => {
                    warn!("gpio{line}: acknowledge edge failed: {e}");
                    return;
                }
            };
            if !entry.armed {
                entry.armed = true;
                edges = edges.saturating_sub(1);
            }
            if edges == 0 || entry.edge == Edge::None {
                return;
            }
            (
                entry.pin.clone(),
                entry.handler.clone(),
                entry.generation,
                edges,
            )
        };

        for _ in 0..edges {
            // a handler may have replaced or dropped its own watch
            if !self.begin_delivery(pin.line(), generation) {
                break;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&pin))).is_err() {
                error!("gpio{} handler panicked", pin.line());
            }
        }
    }
}

fn drain_wake(wake_rx: &mut File) {
    let mut buf = [0u8; 16];
    loop {
        match wake_rx.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn dispatch(shared: Arc<Shared>, mut wake_rx: File, event_batch: usize) {
    let mut events = vec![EpollEvent::empty(); event_batch.max(1)];

    loop {
        let n = match shared.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("gpio watcher wait failed: {e}");
                thread::yield_now();
                continue;
            }
        };

        for event in &events[..n] {
            match event.data() {
                WATCHER_WAKE_TOKEN => {
                    drain_wake(&mut wake_rx);
                    if shared.state() != WatcherState::Running {
                        debug!("gpio watcher dispatcher exiting");
                        return;
                    }
                }
                token => shared.deliver(token),
            }
        }
    }
}

/// Multiplexes edge notifications of any number of pins onto one dispatch
/// thread and hands each edge to the handler currently registered for it.
///
/// Closing (explicitly or on drop) tears down every watch and joins the
/// dispatch thread; no handler starts after [`Watcher::close`] returns.
pub struct Watcher {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(config: &WatcherConfig) -> Result<Self, GpioError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let (wake_rx, wake_tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        epoll.add(&wake_rx, EpollEvent::new(EpollFlags::EPOLLIN, WATCHER_WAKE_TOKEN))?;

        let shared = Arc::new(Shared {
            epoll,
            registry: Mutex::new(Registry {
                state: WatcherState::Running,
                entries: FxHashMap::default(),
                tokens: FxHashMap::default(),
            }),
            delivery: Mutex::new(()),
            closed: Condvar::new(),
            wake_tx: Mutex::new(File::from(wake_tx)),
            next_token: AtomicU64::new(WATCHER_WAKE_TOKEN + 1),
            next_generation: AtomicU64::new(1),
            dispatch_thread: OnceLock::new(),
        });

        let event_batch = config.event_batch;
        let wake_rx = File::from(wake_rx);
        let dispatch_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(WATCHER_THREAD_NAME.into())
            .spawn(move || dispatch(dispatch_shared, wake_rx, event_batch))?;
        let _ = shared.dispatch_thread.set(handle.thread().id());

        info!("gpio watcher started");

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    pub fn start() -> Result<Self, GpioError> {
        Self::new(&WatcherConfig::default())
    }

    pub fn state(&self) -> WatcherState {
        self.shared.state()
    }

    /// Configures `edge` on `pin` and makes `handler` the only target for its
    /// edges, replacing any earlier registration of the same pin.
    ///
    /// The pin is exported first if needed. On error nothing is left
    /// registered for a pin that was not watched before.
    pub fn register_pin<F>(
        &self,
        pin: &Pin,
        edge: Edge,
        handler: F,
    ) -> Result<Subscription, GpioError>
    where
        F: Fn(&Pin) + Send + Sync + 'static,
    {
        let generation = self.shared.register(pin, edge, Arc::new(handler))?;
        self.shared.await_delivery();

        Ok(Subscription {
            line: pin.line(),
            generation,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Stops delivery for `pin`. Unknown pins are ignored.
    pub fn unregister_pin(&self, pin: &Pin) {
        if self.shared.unregister(pin.line(), None) {
            self.shared.await_delivery();
        }
    }

    pub fn is_registered(&self, pin: &Pin) -> bool {
        self.shared.registry.lock().entries.contains_key(&pin.line())
    }

    pub fn registered_lines(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self.shared.registry.lock().entries.keys().copied().collect();
        lines.sort_unstable();
        lines
    }

    /// Stops the watcher and joins its dispatch thread. Concurrent callers
    /// all return only after teardown has finished. Called from a handler it
    /// cannot join, and the dispatcher exits once that handler returns.
    pub fn close(&self) {
        let first = {
            let mut registry = self.shared.registry.lock();
            let state = registry.state;
            match state {
                WatcherState::Running => {
                    registry.state = WatcherState::Closing;
                    true
                }
                WatcherState::Closing if !self.shared.on_dispatch_thread() => {
                    self.shared
                        .closed
                        .wait_while(&mut registry, |r| r.state == WatcherState::Closing);
                    false
                }
                _ => false,
            }
        };

        if first {
            self.shared.wake();

            let mut registry = self.shared.registry.lock();
            registry.tokens.clear();
            let entries: Vec<WatchEntry> = registry.entries.drain().map(|(_, e)| e).collect();
            let released = entries.len();
            for entry in entries {
                self.shared.release(entry);
            }
            registry.state = WatcherState::Stopped;
            self.shared.closed.notify_all();
            drop(registry);
            info!("gpio watcher closed, released {released} watches");
        }

        if self.shared.on_dispatch_thread() {
            debug!("gpio watcher closed from a handler");
            return;
        }
        // held across the join so a late caller returns after it finishes
        let mut dispatcher = self.dispatcher.lock();
        if let Some(handle) = dispatcher.take()
            && handle.join().is_err()
        {
            error!("gpio watcher dispatcher panicked");
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// A revocable registration returned by [`Watcher::register_pin`].
///
/// Dropping it leaves the watch in place. A subscription only ever revokes
/// the registration it was created for: once the pin is re-registered the
/// older subscription becomes inert.
pub struct Subscription {
    line: u32,
    generation: u64,
    shared: Weak<Shared>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("line", &self.line)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Subscription {
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.is_current(self.line, self.generation))
            .unwrap_or(false)
    }

    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade()
            && shared.unregister(self.line, Some(self.generation))
        {
            shared.await_delivery();
        }
    }
}
