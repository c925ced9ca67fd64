use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SysfsConfig;
use crate::error::GpioError;
use crate::gpio::{Edge, GpioBackend, Level, Mode, NotificationSource};

const SYSFS_BACKEND_EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Drives lines through the kernel's `/sys/class/gpio` interface.
pub struct SysfsBackend {
    root: PathBuf,
    export_timeout: Duration,
}

impl SysfsBackend {
    pub fn new(config: &SysfsConfig) -> Self {
        Self {
            root: config.root.clone(),
            export_timeout: Duration::from_millis(config.export_timeout_ms),
        }
    }

    fn line_dir(&self, line: u32) -> PathBuf {
        self.root.join(format!("gpio{line}"))
    }

    fn attr(&self, line: u32, name: &str) -> PathBuf {
        self.line_dir(line).join(name)
    }

    fn write_file(path: &Path, contents: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(contents.as_bytes())
    }

    fn read_attr(&self, line: u32, name: &str) -> Result<String, GpioError> {
        let path = self.attr(line, name);
        fs::read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                GpioError::Export(format!("gpio{line} is not exported"))
            } else {
                GpioError::Io(e)
            }
        })
    }

    fn write_attr(&self, line: u32, name: &str, contents: &str) -> Result<(), GpioError> {
        let path = self.attr(line, name);
        Self::write_file(&path, contents).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                GpioError::Export(format!("gpio{line} is not exported"))
            } else {
                GpioError::Io(e)
            }
        })
    }

    // udev may still be fixing permissions right after the export.
    fn wait_writable(&self, line: u32) -> Result<(), GpioError> {
        let value = self.attr(line, "value");
        let deadline = Instant::now() + self.export_timeout;
        loop {
            match OpenOptions::new().write(true).open(&value) {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(GpioError::Export(format!(
                        "gpio{line} did not become writable: {e}"
                    )));
                }
                Err(_) => thread::sleep(SYSFS_BACKEND_EXPORT_POLL_INTERVAL),
            }
        }
    }
}

impl GpioBackend for SysfsBackend {
    fn export(&self, line: u32) -> Result<(), GpioError> {
        if !self.is_exported(line) {
            match Self::write_file(&self.root.join("export"), &line.to_string()) {
                Ok(()) => debug!("exported gpio{line}"),
                // EBUSY: somebody else exported it first
                Err(e) if e.raw_os_error() == Some(nix::libc::EBUSY) => {}
                Err(e) => return Err(GpioError::Export(format!("export gpio{line}: {e}"))),
            }
        }
        self.wait_writable(line)
    }

    fn unexport(&self, line: u32) -> Result<(), GpioError> {
        if !self.is_exported(line) {
            return Ok(());
        }
        Self::write_file(&self.root.join("unexport"), &line.to_string())
            .map_err(|e| GpioError::Export(format!("unexport gpio{line}: {e}")))?;
        debug!("unexported gpio{line}");
        Ok(())
    }

    fn is_exported(&self, line: u32) -> bool {
        self.line_dir(line).is_dir()
    }

    fn mode(&self, line: u32) -> Result<Mode, GpioError> {
        Mode::from_sysfs(&self.read_attr(line, "direction")?)
    }

    fn set_mode(&self, line: u32, mode: Mode) -> Result<(), GpioError> {
        self.write_attr(line, "direction", mode.as_sysfs())
    }

    fn read(&self, line: u32) -> Result<Level, GpioError> {
        Level::from_sysfs(&self.read_attr(line, "value")?)
    }

    fn write(&self, line: u32, level: Level) -> Result<(), GpioError> {
        self.write_attr(line, "value", level.as_sysfs())
    }

    fn set_edge(&self, line: u32, edge: Edge) -> Result<(), GpioError> {
        if !self.is_exported(line) {
            return Err(GpioError::Configuration(format!(
                "cannot set edge {} on gpio{line}: not exported",
                edge.as_sysfs()
            )));
        }
        Self::write_file(&self.attr(line, "edge"), edge.as_sysfs()).map_err(|e| {
            GpioError::Configuration(format!("set edge {} on gpio{line}: {e}", edge.as_sysfs()))
        })
    }

    fn open_source(&self, line: u32) -> Result<Box<dyn NotificationSource>, GpioError> {
        let path = self.attr(line, "value");
        let file = File::open(&path).map_err(|e| {
            GpioError::Export(format!("open {}: {e}", path.display()))
        })?;
        Ok(Box::new(ValueFileSource { file }))
    }
}

/// The `value` attribute of an exported line; sysfs flags it with
/// `POLLPRI` whenever the configured edge occurs.
struct ValueFileSource {
    file: File,
}

impl AsFd for ValueFileSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl NotificationSource for ValueFileSource {
    fn acknowledge(&mut self) -> Result<u64, GpioError> {
        // the notification stays pending until the attribute is re-read
        let mut buf = [0u8; 4];
        self.file.seek(SeekFrom::Start(0))?;
        let _ = self.file.read(&mut buf)?;
        Ok(1)
    }

    fn reports_on_arm(&self) -> bool {
        true
    }
}
