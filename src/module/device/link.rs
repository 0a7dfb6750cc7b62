//! Link Manager for the sorting controller.
//!
//! Owns the one physical serial link: candidate-port discovery, the
//! settle-and-probe handshake, rate-limited sending, and bounded
//! reconnection. The link thread is the sole owner of the port; every
//! send request from the rest of the system is serialized through it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::protocol::{DeviceCommand, InboundMsg};
use crate::module::control::Event;
use crate::module::util::conf::Sorter;

/// Device link errors. These never cross the event queue as errors;
/// the control loop observes them as `LinkState` transitions.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Every candidate port was tried and none answered.
    #[error("no sorting controller found on any candidate port")]
    Unavailable,
    /// A write was requested while the link is down.
    #[error("link is not connected")]
    NotConnected,
    /// Reconnection gave up after the configured number of attempts.
    #[error("link lost after {0} reconnect attempts")]
    Lost(u32),
    /// Underlying serial I/O failure.
    #[error("serial i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Connection state of the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Byte-level serial transport.
///
/// The production implementation wraps a `serialport` handle; tests
/// substitute an in-memory fake.
pub trait SerialIo: Send {
    /// Read one byte. `Ok(None)` means the read timed out.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    /// Drop anything pending in the input/output buffers.
    fn clear_buffers(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `SerialIo` over a real serial port.
struct SerialPortIo(Box<dyn serialport::SerialPort>);

impl SerialIo for SerialPortIo {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.0.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.0, buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.0)
    }
    fn clear_buffers(&mut self) -> io::Result<()> {
        self.0
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

/// Opens a transport for a candidate port path.
pub type PortOpener = Box<dyn Fn(&str) -> Result<Box<dyn SerialIo>, LinkError> + Send>;

/// Build the production opener from the sorter configuration.
fn serial_opener(conf: &Sorter) -> PortOpener {
    let baud = conf.baud;
    let read_timeout = Duration::from_millis(conf.read_timeout_ms);
    Box::new(move |path: &str| {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| {
                LinkError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
            })?;
        Ok(Box::new(SerialPortIo(port)) as Box<dyn SerialIo>)
    })
}

/// Minimum inter-command pacing.
///
/// A second send inside the interval is delayed until the interval has
/// elapsed, never dropped.
pub struct RateLimiter {
    interval: Duration,
    last_send: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: None,
        }
    }

    /// Remaining wait before the next send is allowed at `now`.
    pub fn required_delay(&self, now: Instant) -> Duration {
        match self.last_send {
            Some(last) => self
                .interval
                .checked_sub(now.saturating_duration_since(last))
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    /// Record a send happening at `now`.
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    /// Block until a send is allowed, then record it.
    pub fn pace(&mut self) {
        let delay = self.required_delay(Instant::now());
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.mark_sent(Instant::now());
    }
}

/// Accumulates raw bytes into newline-delimited text lines.
///
/// Undecodable lines are dropped with a log entry; they are never fatal.
pub struct LineReader {
    buf: Vec<u8>,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

impl LineReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Push one byte; returns a completed line on newline.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        if byte != b'\n' {
            self.buf.push(byte);
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        match String::from_utf8(raw) {
            Ok(line) => Some(line),
            Err(e) => {
                log::warn!("Dropping undecodable device message: {}", e);
                None
            }
        }
    }
}

/// The device link itself.
pub struct SorterLink {
    conf: Sorter,
    opener: PortOpener,
    port: Option<Box<dyn SerialIo>>,
    port_name: Option<String>,
    state: LinkState,
    limiter: RateLimiter,
    reader: LineReader,
}

impl SorterLink {
    /// Create a link over real serial ports.
    pub fn new(conf: Sorter) -> Self {
        let opener = serial_opener(&conf);
        Self::with_opener(conf, opener)
    }

    /// Create a link with a custom port opener.
    pub fn with_opener(conf: Sorter, opener: PortOpener) -> Self {
        let limiter = RateLimiter::new(Duration::from_millis(conf.command_interval_ms));
        Self {
            conf,
            opener,
            port: None,
            port_name: None,
            state: LinkState::Disconnected,
            limiter,
            reader: LineReader::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Name of the currently bound port, if any.
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Try each candidate port in priority order.
    ///
    /// A successful open is followed by a settle delay (the controller
    /// resets on open), a buffer flush, and a no-op stop probe. The
    /// first candidate surviving all three wins.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        self.state = LinkState::Connecting;
        self.port = None;
        self.port_name = None;
        let candidates = self.conf.ports.clone();
        for path in &candidates {
            log::info!("Trying sorting controller on {}", path);
            let mut port = match (self.opener)(path) {
                Ok(port) => port,
                Err(e) => {
                    log::debug!("Open failed on {}: {}", path, e);
                    continue;
                }
            };
            thread::sleep(Duration::from_millis(self.conf.settle_ms));
            if let Err(e) = port.clear_buffers() {
                log::debug!("Buffer flush failed on {}: {}", path, e);
                continue;
            }
            // No-op probe: a stop command the controller always accepts.
            if let Err(e) = port.write_all(&[DeviceCommand::Stop.to_byte()]) {
                log::debug!("Probe failed on {}: {}", path, e);
                continue;
            }
            if let Err(e) = port.flush() {
                log::debug!("Probe flush failed on {}: {}", path, e);
                continue;
            }
            log::info!("Sorting controller connected on {}", path);
            self.port = Some(port);
            self.port_name = Some(path.clone());
            self.state = LinkState::Connected;
            return Ok(());
        }
        self.state = LinkState::Disconnected;
        Err(LinkError::Unavailable)
    }

    /// Send one command byte, paced by the rate limiter.
    ///
    /// Requires a connected link. On I/O failure the link transitions to
    /// `Disconnected` and the error is returned for the caller (the link
    /// thread) to schedule a reconnect.
    pub fn send(&mut self, command: DeviceCommand) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        self.limiter.pace();
        let byte = command.to_byte();
        let res = match self.port.as_mut() {
            Some(port) => port.write_all(&[byte]).and_then(|_| port.flush()),
            None => return Err(LinkError::NotConnected),
        };
        match res {
            Ok(()) => {
                log::info!("Sent command {:?} ({})", command, byte as char);
                Ok(())
            }
            Err(e) => {
                log::warn!("Write failed, marking link disconnected: {}", e);
                self.disconnect();
                Err(LinkError::Io(e))
            }
        }
    }

    /// Read whatever is pending and return completed inbound messages.
    ///
    /// Returns after the port read times out once, so the link thread
    /// stays responsive to queued send requests.
    pub fn poll_inbound(&mut self) -> Result<Vec<InboundMsg>, LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        let mut msgs = Vec::new();
        let mut read_error = None;
        {
            let reader = &mut self.reader;
            let port = match self.port.as_mut() {
                Some(port) => port,
                None => return Err(LinkError::NotConnected),
            };
            loop {
                match port.read_byte() {
                    Ok(Some(byte)) => {
                        if let Some(line) = reader.push(byte) {
                            match InboundMsg::parse(&line) {
                                Some(msg) => msgs.push(msg),
                                None => {
                                    log::warn!("Dropping malformed device message: {:?}", line)
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(e) = read_error {
            log::warn!("Read failed, marking link disconnected: {}", e);
            self.disconnect();
            return Err(LinkError::Io(e));
        }
        Ok(msgs)
    }

    fn disconnect(&mut self) {
        self.port = None;
        self.port_name = None;
        self.state = LinkState::Disconnected;
    }
}

/// Requests accepted by the link thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkRequest {
    Send(DeviceCommand),
}

/// One reconnect attempt triggered by a send request after link loss.
///
/// Returns whether the link is back up. The triggering command is sent
/// best-effort; when it has to be dropped the drop is logged by name so
/// no command disappears silently.
fn recover_and_send(link: &mut SorterLink, cmd: DeviceCommand) -> bool {
    if link.connect().is_err() {
        log::warn!("Reconnect failed, dropping command {:?}", cmd);
        return false;
    }
    if let Err(e) = link.send(cmd) {
        log::warn!("Post-recovery send failed, dropping command {:?}: {}", cmd, e);
    }
    true
}

/// Start the link manager thread.
///
/// The thread alternates between servicing send requests and polling
/// inbound data. On I/O error it retries connection with a fixed
/// backoff; after the configured number of failed attempts it surfaces
/// a terminal link-lost status and waits, retrying once per incoming
/// send request (lazy recovery).
pub fn run(
    mut link: SorterLink,
    rx: Receiver<LinkRequest>,
    tx: Sender<Event>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let attempts = link.conf.reconnect_attempts;
    let backoff = Duration::from_millis(link.conf.reconnect_backoff_ms);
    thread::spawn(move || {
        log::info!("Link manager started");
        let mut failed_attempts: u32 = 0;
        let mut lost = false;
        while !shutdown.load(Ordering::Relaxed) {
            if link.state() != LinkState::Connected {
                if lost {
                    // Terminal until an operator-driven send arrives.
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(LinkRequest::Send(cmd)) => {
                            log::info!("Send requested after link loss, retrying once");
                            if recover_and_send(&mut link, cmd) {
                                lost = false;
                                failed_attempts = 0;
                                let _ = tx.send(Event::Link(LinkState::Connected));
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    continue;
                }
                let _ = tx.send(Event::Link(LinkState::Connecting));
                if link.connect().is_ok() {
                    failed_attempts = 0;
                    let _ = tx.send(Event::Link(LinkState::Connected));
                } else {
                    failed_attempts += 1;
                    log::warn!(
                        "Reconnect attempt {}/{} failed",
                        failed_attempts,
                        attempts
                    );
                    if failed_attempts >= attempts {
                        lost = true;
                        log::error!("{}", LinkError::Lost(failed_attempts));
                        let _ = tx.send(Event::Link(LinkState::Disconnected));
                        let _ = tx.send(Event::Device(InboundMsg::StatusText(
                            format!("{}", LinkError::Lost(failed_attempts)),
                        )));
                    } else {
                        let _ = tx.send(Event::Link(LinkState::Disconnected));
                        thread::sleep(backoff);
                    }
                }
                continue;
            }

            // Service at most a handful of queued sends, then poll reads.
            for _ in 0..4 {
                match rx.try_recv() {
                    Ok(LinkRequest::Send(cmd)) => {
                        if let Err(e) = link.send(cmd) {
                            log::warn!("Send failed: {}", e);
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            match link.poll_inbound() {
                Ok(msgs) => {
                    for msg in msgs {
                        if tx.send(Event::Device(msg)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Inbound poll failed: {}", e);
                    let _ = tx.send(Event::Link(LinkState::Disconnected));
                }
            }
        }
        log::info!("Link manager stopped");
    })
}
