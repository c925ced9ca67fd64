use std::fmt;
use std::os::fd::AsFd;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::board;
use crate::error::GpioError;
use crate::watcher::Subscription;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_sysfs(value: &str) -> Result<Self, GpioError> {
        match value.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(GpioError::InvalidValue(format!(
                "unexpected level {other:?}"
            ))),
        }
    }

    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Level::Low => "0",
            Level::High => "1",
        }
    }
}

impl std::ops::Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Input,
    Output,
}

impl Mode {
    pub fn from_sysfs(value: &str) -> Result<Self, GpioError> {
        match value.trim() {
            "in" => Ok(Mode::Input),
            "out" | "high" | "low" => Ok(Mode::Output),
            other => Err(GpioError::InvalidValue(format!(
                "unexpected direction {other:?}"
            ))),
        }
    }

    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Mode::Input => "in",
            Mode::Output => "out",
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }

    /// Whether a transition from `from` to `to` triggers this edge mode.
    pub fn matches(&self, from: Level, to: Level) -> bool {
        match (self, from, to) {
            (_, a, b) if a == b => false,
            (Edge::None, _, _) => false,
            (Edge::Rising, Level::Low, Level::High) => true,
            (Edge::Falling, Level::High, Level::Low) => true,
            (Edge::Both, _, _) => true,
            _ => false,
        }
    }
}

/// Device handle the watcher blocks on to learn about edges of one line.
pub trait NotificationSource: AsFd + Send {
    /// Consumes pending notifications and returns the number of edges they
    /// stand for.
    fn acknowledge(&mut self) -> Result<u64, GpioError>;

    /// Whether the source reports readiness once as soon as it joins a wait
    /// set, before any edge has happened.
    fn reports_on_arm(&self) -> bool {
        false
    }
}

/// Board access: line I/O, export plumbing and edge configuration.
pub trait GpioBackend: Send + Sync {
    fn export(&self, line: u32) -> Result<(), GpioError>;
    fn unexport(&self, line: u32) -> Result<(), GpioError>;
    fn is_exported(&self, line: u32) -> bool;
    fn mode(&self, line: u32) -> Result<Mode, GpioError>;
    fn set_mode(&self, line: u32, mode: Mode) -> Result<(), GpioError>;
    fn read(&self, line: u32) -> Result<Level, GpioError>;
    fn write(&self, line: u32, level: Level) -> Result<(), GpioError>;
    /// Fails with [`GpioError::Configuration`] when the line is not exported.
    fn set_edge(&self, line: u32, edge: Edge) -> Result<(), GpioError>;
    /// Fails with [`GpioError::Export`] when the line is not exported.
    fn open_source(&self, line: u32) -> Result<Box<dyn NotificationSource>, GpioError>;
}

#[derive(Clone)]
pub struct Pin {
    line: u32,
    backend: Arc<dyn GpioBackend>,
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin").field("line", &self.line).finish()
    }
}

impl Pin {
    pub fn new(line: u32, backend: Arc<dyn GpioBackend>) -> Self {
        Self { line, backend }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub(crate) fn backend(&self) -> &Arc<dyn GpioBackend> {
        &self.backend
    }

    pub fn export(&self) -> Result<(), GpioError> {
        self.backend.export(self.line)
    }

    pub fn unexport(&self) -> Result<(), GpioError> {
        self.backend.unexport(self.line)
    }

    pub fn is_exported(&self) -> bool {
        self.backend.is_exported(self.line)
    }

    pub fn mode(&self) -> Result<Mode, GpioError> {
        self.backend.mode(self.line)
    }

    pub fn set_mode(&self, mode: Mode) -> Result<(), GpioError> {
        self.backend.set_mode(self.line, mode)
    }

    pub fn read(&self) -> Result<Level, GpioError> {
        self.backend.read(self.line)
    }

    pub fn write(&self, level: Level) -> Result<(), GpioError> {
        self.backend.write(self.line, level)
    }

    pub fn high(&self) -> Result<(), GpioError> {
        self.write(Level::High)
    }

    pub fn low(&self) -> Result<(), GpioError> {
        self.write(Level::Low)
    }

    pub fn toggle(&self) -> Result<(), GpioError> {
        let level = self.read()?;
        self.write(!level)
    }

    pub fn set_edge(&self, edge: Edge) -> Result<(), GpioError> {
        self.backend.set_edge(self.line, edge)
    }

    pub fn open_source(&self) -> Result<Box<dyn NotificationSource>, GpioError> {
        self.backend.open_source(self.line)
    }

    /// Registers `handler` for `edge` on the default watcher started by
    /// [`board::open`].
    pub fn watch<F>(&self, edge: Edge, handler: F) -> Result<Subscription, GpioError>
    where
        F: Fn(&Pin) + Send + Sync + 'static,
    {
        board::default_watcher()?.register_pin(self, edge, handler)
    }

    /// Stops watching this pin on the default watcher. No-op when the board
    /// is closed or the pin is not watched.
    pub fn unwatch(&self) {
        if let Ok(watcher) = board::default_watcher() {
            watcher.unregister_pin(self);
        }
    }
}
