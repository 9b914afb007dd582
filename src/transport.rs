//! The serial transport contract consumed by the drivers.
//!
//! Drivers see a minimal duplex byte stream: ordered writes, chunked polled
//! reads, a baud-rate knob and best-effort control lines. Port enumeration
//! is a separate capability that drivers never use but the outer process may
//! query.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, trace};
use serialport::SerialPort;

use crate::{Error, Result};

/// Abstract byte-stream duplex with control-line and baud-rate capabilities.
pub trait Transport {
    /// Acquires the underlying port. Fails with `Error::TransportOpen`.
    fn connect(&mut self) -> Result<()>;

    /// Releases the port. Always safe; idempotent.
    fn disconnect(&mut self);

    /// Queues `bytes` for transmission, preserving byte order.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Applies `baud` to subsequent bytes. Consumers must assume at most a
    /// 50 ms blackout and one lost partial frame around the change.
    fn set_baud(&mut self, baud: u32) -> Result<()>;

    /// Drives DTR. Returns whether the signal was honoured; `false` is not
    /// an error, some hosts cannot assert control lines.
    fn set_dtr(&mut self, level: bool) -> bool;

    /// Drives RTS. Same contract as [`Transport::set_dtr`].
    fn set_rts(&mut self, level: bool) -> bool;

    /// Waits up to `wait` for received bytes and returns one chunk, or
    /// `None` when nothing arrived within the budget.
    fn poll_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>>;
}

/// Optional capability: enumerating candidate ports.
pub trait PortEnumeration {
    fn available_ports(&self) -> Result<Vec<String>>;
}

/// [`Transport`] backed by a host serial port.
pub struct SerialTransport {
    path: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud: u32) -> SerialTransport {
        SerialTransport {
            path: path.into(),
            baud,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::NotConnected, "port is not open")))
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> Result<()> {
        debug!("Opening serial port {} at {} baud", self.path, self.baud);

        let port = serialport::new(&self.path, self.baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(Error::TransportOpen)?;

        self.port = Some(port);

        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.path);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port()?;

        port.write_all(bytes).map_err(Error::TransportWrite)?;
        port.flush().map_err(Error::TransportWrite)?;

        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        debug!("Changing baud rate to {}", baud);

        self.port()?.set_baud_rate(baud).map_err(Error::TransportBaud)?;
        self.baud = baud;

        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> bool {
        match self.port() {
            Ok(port) => port.write_data_terminal_ready(level).is_ok(),
            Err(_) => false,
        }
    }

    fn set_rts(&mut self, level: bool) -> bool {
        match self.port() {
            Ok(port) => port.write_request_to_send(level).is_ok(),
            Err(_) => false,
        }
    }

    fn poll_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let port = self.port()?;

        port.set_timeout(wait.max(Duration::from_millis(1)))
            .map_err(Error::TransportBaud)?;

        let mut buf = [0u8; 4096];

        match port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                trace!("rx chunk of {} bytes", n);
                Ok(Some(buf[..n].to_vec()))
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

impl PortEnumeration for SerialTransport {
    fn available_ports(&self) -> Result<Vec<String>> {
        let ports = serialport::available_ports().map_err(Error::TransportOpen)?;

        Ok(ports.into_iter().map(|info| info.port_name).collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted transport for driver tests: received chunks are either
    //! pre-queued or produced by a responder closure observing each write.

    use std::collections::VecDeque;
    use std::time::Duration;

    use super::Transport;
    use crate::Result;

    type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>;

    pub struct ScriptedTransport {
        pub connected: bool,
        pub rx: VecDeque<Vec<u8>>,
        pub writes: Vec<Vec<u8>>,
        pub baud_history: Vec<u32>,
        pub dtr_history: Vec<bool>,
        pub rts_history: Vec<bool>,
        pub honour_control_lines: bool,
        responder: Option<Responder>,
    }

    impl ScriptedTransport {
        pub fn new() -> ScriptedTransport {
            ScriptedTransport {
                connected: false,
                rx: VecDeque::new(),
                writes: Vec::new(),
                baud_history: Vec::new(),
                dtr_history: Vec::new(),
                rts_history: Vec::new(),
                honour_control_lines: true,
                responder: None,
            }
        }

        /// Installs a closure invoked on every write; the chunks it returns
        /// are queued for subsequent polls.
        pub fn respond_with(mut self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + 'static) -> Self {
            self.responder = Some(Box::new(responder));
            self
        }

        pub fn queue(&mut self, chunk: &[u8]) {
            self.rx.push_back(chunk.to_vec());
        }

        pub fn written(&self) -> Vec<u8> {
            self.writes.concat()
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            self.writes.push(bytes.to_vec());

            if let Some(responder) = self.responder.as_mut() {
                for chunk in responder(bytes) {
                    self.rx.push_back(chunk);
                }
            }

            Ok(())
        }

        fn set_baud(&mut self, baud: u32) -> Result<()> {
            self.baud_history.push(baud);
            Ok(())
        }

        fn set_dtr(&mut self, level: bool) -> bool {
            self.dtr_history.push(level);
            self.honour_control_lines
        }

        fn set_rts(&mut self, level: bool) -> bool {
            self.rts_history.push(level);
            self.honour_control_lines
        }

        fn poll_chunk(&mut self, _wait: Duration) -> Result<Option<Vec<u8>>> {
            Ok(self.rx.pop_front())
        }
    }
}
