//! Process-wide board access: the backend every [`Pin`] created through
//! [`pin`] talks to, and the default [`Watcher`] behind [`Pin::watch`].

use log::{info, warn};
use std::sync::Arc;

use parking_lot::{RwLock, const_rwlock};
use rustc_hash::FxHashMap;

use crate::backend::SysfsBackend;
use crate::config::{PinConfig, SysfsConfig, WatcherConfig};
use crate::error::GpioError;
use crate::gpio::{GpioBackend, Mode, Pin};
use crate::watcher::Watcher;

struct Board {
    backend: Arc<dyn GpioBackend>,
    watcher: Arc<Watcher>,
}

static BOARD: RwLock<Option<Board>> = const_rwlock(None);

/// Opens the board through sysfs with default settings.
pub fn open() -> Result<(), GpioError> {
    let backend = Arc::new(SysfsBackend::new(&SysfsConfig::default()));
    open_with(backend, &WatcherConfig::default())
}

/// Opens the board on `backend` and starts the default watcher. Does nothing
/// if the board is already open.
pub fn open_with(backend: Arc<dyn GpioBackend>, config: &WatcherConfig) -> Result<(), GpioError> {
    let mut board = BOARD.write();
    if board.is_some() {
        return Ok(());
    }
    let watcher = Arc::new(Watcher::new(config)?);
    *board = Some(Board { backend, watcher });
    info!("board opened");
    Ok(())
}

/// Stops the default watcher and releases the board. Safe to call when the
/// board is not open.
pub fn close() {
    let board = BOARD.write().take();
    if let Some(board) = board {
        board.watcher.close();
        info!("board closed");
    }
}

pub fn is_open() -> bool {
    BOARD.read().is_some()
}

pub fn default_watcher() -> Result<Arc<Watcher>, GpioError> {
    BOARD
        .read()
        .as_ref()
        .map(|b| b.watcher.clone())
        .ok_or(GpioError::Closed)
}

/// A pin on the open board.
pub fn pin(line: u32) -> Result<Pin, GpioError> {
    BOARD
        .read()
        .as_ref()
        .map(|b| Pin::new(line, b.backend.clone()))
        .ok_or(GpioError::Closed)
}

/// Exports every configured line as an input and watches it on the default
/// watcher, in line order. If any line fails, the lines set up so far are
/// released and the board is closed.
pub fn watch_configured<F, H>(
    pins: &FxHashMap<u32, PinConfig>,
    mut handler_for: F,
) -> Result<Vec<Pin>, GpioError>
where
    F: FnMut(u32) -> H,
    H: Fn(&Pin) + Send + Sync + 'static,
{
    let mut configured: Vec<(&u32, &PinConfig)> = pins.iter().collect();
    configured.sort_unstable_by_key(|(line, _)| **line);

    let mut touched = Vec::with_capacity(configured.len());
    let result = configured
        .into_iter()
        .try_for_each(|(&line, pin_cfg)| -> Result<(), GpioError> {
            let pin = pin(line)?;
            // a timed-out export may still have created the line
            touched.push(pin.clone());
            pin.export()?;
            pin.set_mode(Mode::Input)?;
            pin.watch(pin_cfg.edge, handler_for(line))?;
            info!(
                "Watching gpio{line} ({}) for {} edges",
                pin_cfg.name,
                pin_cfg.edge.as_sysfs()
            );
            Ok(())
        });

    match result {
        Ok(()) => Ok(touched),
        Err(e) => {
            release(&touched);
            Err(e)
        }
    }
}

/// Unwatches and unexports `pins`, then closes the board.
pub fn release(pins: &[Pin]) {
    for pin in pins {
        pin.unwatch();
        if let Err(e) = pin.unexport() {
            warn!("gpio{}: unexport failed: {e}", pin.line());
        }
    }
    close();
}
