pub mod backend;
pub mod board;
pub mod config;
pub mod error;
pub mod gpio;
pub mod queue;
pub mod watcher;

pub use backend::{MockGpioBackend, SysfsBackend};
pub use config::{AppConfig, PinConfig, SysfsConfig, WatcherConfig};
pub use error::GpioError;
pub use gpio::{Edge, GpioBackend, Level, Mode, NotificationSource, Pin};
pub use queue::{EdgeEvent, EventSink, EventStream};
pub use watcher::{Handler, Subscription, Watcher, WatcherState};
