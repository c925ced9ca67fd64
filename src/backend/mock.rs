use log::warn;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{Edge, GpioBackend, Level, Mode, NotificationSource};

/// In-memory board. Lines can be jumpered together so that an output drives
/// the input on the other end, and each exported line signals its
/// notification source through a pipe whenever its configured edge occurs.
#[derive(Default)]
pub struct MockGpioBackend {
    board: Mutex<MockBoard>,
}

#[derive(Default)]
struct MockBoard {
    pins: FxHashMap<u32, MockPinState>, // keyed by line
    jumpers: FxHashMap<u32, u32>,
}

struct MockPinState {
    exported: bool,
    mode: Mode,
    level: Level,
    latch: Level,
    edge: Edge,
    notifier: Option<File>,
}

impl Default for MockPinState {
    fn default() -> Self {
        Self {
            exported: false,
            mode: Mode::Input,
            level: Level::Low,
            latch: Level::Low,
            edge: Edge::None,
            notifier: None,
        }
    }
}

impl MockBoard {
    fn set_level(&mut self, line: u32, level: Level) {
        let pin = self.pins.entry(line).or_default();
        let previous = pin.level;
        pin.level = level;

        if pin.exported && pin.edge.matches(previous, level) {
            if let Some(notifier) = pin.notifier.as_mut() {
                if let Err(e) = notifier.write_all(&[1]) {
                    warn!("mock gpio{line}: dropping edge notification: {e}");
                }
            }
        }

        if pin.mode != Mode::Output {
            return;
        }
        if let Some(&peer) = self.jumpers.get(&line) {
            let peer_is_input = self
                .pins
                .get(&peer)
                .map(|p| p.mode == Mode::Input)
                .unwrap_or(true);
            if peer_is_input {
                self.set_level(peer, level);
            }
        }
    }

    fn peer_output_level(&self, line: u32) -> Option<Level> {
        let peer = self.jumpers.get(&line)?;
        self.pins
            .get(peer)
            .filter(|p| p.mode == Mode::Output)
            .map(|p| p.level)
    }
}

impl MockGpioBackend {
    /// Wires two lines together, like a jumper across two header pins.
    pub fn jumper(&self, a: u32, b: u32) {
        let mut board = self.board.lock();
        board.jumpers.insert(a, b);
        board.jumpers.insert(b, a);
    }

    /// Applies an external signal to an input line.
    pub fn drive(&self, line: u32, level: Level) -> Result<(), GpioError> {
        let mut board = self.board.lock();
        if board.pins.get(&line).map(|p| p.mode) == Some(Mode::Output) {
            return Err(GpioError::InvalidState(format!(
                "gpio{line} is an output and cannot be driven externally"
            )));
        }
        board.set_level(line, level);
        Ok(())
    }

    /// Currently configured edge of a line.
    pub fn edge(&self, line: u32) -> Edge {
        self.board
            .lock()
            .pins
            .get(&line)
            .map(|p| p.edge)
            .unwrap_or_default()
    }
}

impl GpioBackend for MockGpioBackend {
    fn export(&self, line: u32) -> Result<(), GpioError> {
        self.board.lock().pins.entry(line).or_default().exported = true;
        Ok(())
    }

    fn unexport(&self, line: u32) -> Result<(), GpioError> {
        if let Some(pin) = self.board.lock().pins.get_mut(&line) {
            pin.exported = false;
            pin.edge = Edge::None;
            pin.notifier = None;
        }
        Ok(())
    }

    fn is_exported(&self, line: u32) -> bool {
        self.board
            .lock()
            .pins
            .get(&line)
            .map(|p| p.exported)
            .unwrap_or(false)
    }

    fn mode(&self, line: u32) -> Result<Mode, GpioError> {
        Ok(self
            .board
            .lock()
            .pins
            .get(&line)
            .map(|p| p.mode)
            .unwrap_or(Mode::Input))
    }

    fn set_mode(&self, line: u32, mode: Mode) -> Result<(), GpioError> {
        let mut board = self.board.lock();
        let pin = board.pins.entry(line).or_default();
        pin.mode = mode;
        match mode {
            Mode::Output => {
                let latch = pin.latch;
                board.set_level(line, latch);
            }
            Mode::Input => {
                if let Some(level) = board.peer_output_level(line) {
                    board.set_level(line, level);
                }
            }
        }
        Ok(())
    }

    fn read(&self, line: u32) -> Result<Level, GpioError> {
        Ok(self
            .board
            .lock()
            .pins
            .get(&line)
            .map(|p| p.level)
            .unwrap_or(Level::Low))
    }

    fn write(&self, line: u32, level: Level) -> Result<(), GpioError> {
        let mut board = self.board.lock();
        let pin = board.pins.entry(line).or_default();
        pin.latch = level;
        if pin.mode == Mode::Output {
            board.set_level(line, level);
        }
        Ok(())
    }

    fn set_edge(&self, line: u32, edge: Edge) -> Result<(), GpioError> {
        let mut board = self.board.lock();
        match board.pins.get_mut(&line) {
            Some(pin) if pin.exported => {
                pin.edge = edge;
                Ok(())
            }
            _ => Err(GpioError::Configuration(format!(
                "cannot set edge {} on gpio{line}: not exported",
                edge.as_sysfs()
            ))),
        }
    }

    fn open_source(&self, line: u32) -> Result<Box<dyn NotificationSource>, GpioError> {
        let mut board = self.board.lock();
        let pin = match board.pins.get_mut(&line) {
            Some(pin) if pin.exported => pin,
            _ => return Err(GpioError::Export(format!("gpio{line} is not exported"))),
        };
        let (reader, writer) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        pin.notifier = Some(File::from(writer));
        Ok(Box::new(PipeSource {
            reader: File::from(reader),
        }))
    }
}

/// One byte per edge; the watcher drains them all on wake.
struct PipeSource {
    reader: File,
}

impl AsFd for PipeSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl NotificationSource for PipeSource {
    fn acknowledge(&mut self) -> Result<u64, GpioError> {
        let mut buf = [0u8; 64];
        let mut edges = 0;
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => edges += n as u64,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(GpioError::Io(e)),
            }
        }
        Ok(edges)
    }
}
