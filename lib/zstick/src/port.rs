use crate::config::PortConfig;
use crate::shared::LinkResult;
use std::io::{self, Read, Write};
use std::time::Duration;

/// The wire the engine owns. The production implementation wraps a real
/// serial device; tests drive the engine through an in-memory double. The
/// I/O thread is the only caller.
pub trait SerialLink: Send {
    /// Read one byte, waiting at most `timeout`. `Ok(None)` means the wait
    /// elapsed with nothing available.
    fn read_byte(&mut self, timeout: Duration) -> LinkResult<Option<u8>>;

    /// Write the whole buffer within `timeout`.
    fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> LinkResult<()>;

    /// Close and reopen the underlying device in place. Used once after a
    /// write failure before giving up on the port.
    fn cycle(&mut self) -> LinkResult<()>;
}

/// A real serial port at 8N1 with caller configured baud rate.
pub struct SystemPort {
    path: String,
    cfg: PortConfig,
    port: Box<dyn serialport::SerialPort>,
}

impl SystemPort {
    pub fn open(path: &str, cfg: &PortConfig) -> LinkResult<SystemPort> {
        let port = Self::open_raw(path, cfg)?;
        Ok(SystemPort {
            path: path.to_string(),
            cfg: cfg.clone(),
            port,
        })
    }

    fn open_raw(path: &str, cfg: &PortConfig) -> LinkResult<Box<dyn serialport::SerialPort>> {
        let port = serialport::new(path, cfg.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(cfg.write_timeout_ms))
            .open()
            .map_err(io::Error::from)?;
        Ok(port)
    }
}

impl SerialLink for SystemPort {
    fn read_byte(&mut self, timeout: Duration) -> LinkResult<Option<u8>> {
        self.port.set_timeout(timeout).map_err(io::Error::from)?;

        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(ref err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> LinkResult<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)?;
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn cycle(&mut self) -> LinkResult<()> {
        // Dropping the old handle closes the device before the reopen
        self.port = Self::open_raw(&self.path, &self.cfg)?;
        Ok(())
    }
}
