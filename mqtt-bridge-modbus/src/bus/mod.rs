//! Modbus-RTU bus controller.
//!
//! [`ModbusBus`] owns the serial transport and serializes every transaction
//! on the half-duplex line. Callers first take the bus with
//! [`acquire`](ModbusBus::acquire), a non-blocking try-lock, and run the
//! transaction through the returned [`BusGuard`]. Dropping the guard
//! releases the bus on every exit path.

mod frame;
mod link;
mod status;

pub use frame::{
    MAX_BITS, Request, append_crc, crc16, decode_response, encode_request, hex_dump,
    inter_frame_silence,
};
pub use link::{DirectionMode, LinkOpener, PassiveLink, RtsDirectionLink, SerialLink, SerialOpener};
pub use status::ModbusStatus;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BusError, ConfigError};
use crate::model::BusConfig;

/// Size of the RX capture window.
pub const RX_CAPTURE_LEN: usize = 64;

/// Leading zero bytes dropped after the direction release.
const MAX_LEADING_ZEROS: usize = 8;

/// Timing of the direction line and of responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    /// Settle time around each direction flip.
    pub guard: Duration,
    /// Time allowed for a complete response.
    pub response_timeout: Duration,
    /// Window after the release in which leading 0x00 bytes are dropped.
    pub first_byte_window: Duration,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            guard: Duration::from_micros(50),
            response_timeout: Duration::from_millis(1000),
            first_byte_window: Duration::from_micros(2500),
        }
    }
}

struct Port {
    link: Box<dyn SerialLink>,
    config: BusConfig,
    last_activity: Option<Instant>,
}

/// Exclusive holder of the serial line.
pub struct ModbusBus {
    opener: Box<dyn LinkOpener>,
    timing: BusTiming,
    port: tokio::sync::Mutex<Option<Port>>,
    config: Mutex<Option<BusConfig>>,
    rx: Mutex<Vec<u8>>,
    busy: AtomicBool,
    active: AtomicBool,
    initialized: AtomicBool,
    error_count: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModbusBus {
    pub fn new(opener: impl LinkOpener + 'static, timing: BusTiming) -> Self {
        Self {
            opener: Box::new(opener),
            timing,
            port: tokio::sync::Mutex::new(None),
            config: Mutex::new(None),
            rx: Mutex::new(Vec::with_capacity(RX_CAPTURE_LEN)),
            busy: AtomicBool::new(false),
            active: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
        }
    }

    /// Open and configure the port, driving the direction line to receive.
    ///
    /// Calling it again with the same baud and framing keeps the open port.
    /// A transaction in flight finishes before the port is replaced.
    pub async fn begin(&self, config: &BusConfig) -> Result<(), BusError> {
        if config.baud == 0 {
            return Err(ConfigError::invalid("bus baud must be positive").into());
        }

        let mut port = self.port.lock().await;
        if let Some(current) = port.as_ref() {
            if current.config.same_line(config) {
                *lock(&self.config) = Some(config.clone());
                return Ok(());
            }
        }

        *port = None;
        self.initialized.store(false, Ordering::Release);

        let mut link = self.opener.open(config)?;
        link.set_direction(false)?;
        *port = Some(Port {
            link,
            config: config.clone(),
            last_activity: None,
        });
        *lock(&self.config) = Some(config.clone());
        lock(&self.rx).clear();
        self.initialized.store(true, Ordering::Release);

        info!(
            baud = config.baud,
            format = %config.serial_format,
            "Modbus bus initialized"
        );
        Ok(())
    }

    /// Try to take the bus. `None` means another transaction holds it.
    pub fn acquire(&self) -> Option<BusGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusGuard { bus: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Operator-visible bus switch. Does not close the port.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of transactions that ended with a non-success status.
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Configuration of the open port.
    pub fn config(&self) -> Option<BusConfig> {
        lock(&self.config).clone()
    }

    pub fn timing(&self) -> BusTiming {
        self.timing
    }

    /// Bytes received by the last transaction, as hex.
    pub fn dump_rx(&self) -> String {
        hex_dump(&lock(&self.rx))
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn fail(&self, status: ModbusStatus) -> BusError {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        BusError::Transaction { status }
    }

    async fn transact(&self, request: &Request) -> Result<Vec<u16>, BusError> {
        if !self.is_initialized() {
            return Err(BusError::NotInitialized);
        }
        if let Err(status) = request.validate() {
            return Err(self.fail(status));
        }

        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or(BusError::NotInitialized)?;
        let baud = port.config.baud;
        let format = port.config.serial_format;

        if let Some(last) = port.last_activity {
            tokio::time::sleep_until(last + inter_frame_silence(baud, format)).await;
        }

        let frame = encode_request(request);
        let result = match self.transmit(port, &frame).await {
            Ok(()) => self.receive(port, request).await,
            Err(e) => Err(BusError::Io(e)),
        };
        port.last_activity = Some(Instant::now());

        match result {
            Ok(words) => {
                debug!(
                    slave_id = request.slave_id,
                    function = %request.function,
                    address = request.address,
                    words = words.len(),
                    "Modbus transaction complete"
                );
                Ok(words)
            }
            Err(BusError::Transaction { status }) => Err(self.fail(status)),
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn transmit(&self, port: &mut Port, frame: &[u8]) -> std::io::Result<()> {
        port.link.set_direction(true)?;
        tokio::time::sleep(self.timing.guard).await;

        let sent = async {
            port.link.write_all(frame).await?;
            port.link.flush().await
        }
        .await;

        // Wait for the frame to leave the line before releasing it.
        let on_line = frame::frame_time(frame.len(), port.config.baud, port.config.serial_format);
        tokio::time::sleep(on_line + self.timing.guard).await;
        lock(&self.rx).clear();
        port.link.set_direction(false)?;
        sent
    }

    async fn receive(&self, port: &mut Port, request: &Request) -> Result<Vec<u16>, BusError> {
        let released = Instant::now();
        let frame_budget = frame::frame_time(
            frame::max_response_len(request),
            port.config.baud,
            port.config.serial_format,
        ) + inter_frame_silence(port.config.baud, port.config.serial_format);
        let deadline = released + self.timing.response_timeout.max(frame_budget);

        let mut frame = Vec::with_capacity(frame::max_response_len(request));
        let mut dropped = 0;
        let mut buf = [0u8; 256];

        loop {
            if let Some(len) = frame::expected_response_len(request.function, &frame) {
                if frame.len() >= len {
                    frame.truncate(len);
                    break;
                }
            }

            let n = match tokio::time::timeout_at(deadline, port.link.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => {
                    return Err(BusError::Transaction {
                        status: ModbusStatus::ResponseTimedOut,
                    });
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(BusError::Io(e)),
            };

            let mut rx = lock(&self.rx);
            for &byte in &buf[..n] {
                if frame.is_empty()
                    && byte == 0x00
                    && dropped < MAX_LEADING_ZEROS
                    && released.elapsed() <= self.timing.first_byte_window
                {
                    dropped += 1;
                    continue;
                }
                frame.push(byte);
                if rx.len() < RX_CAPTURE_LEN {
                    rx.push(byte);
                }
            }
        }

        if dropped > 0 {
            debug!(dropped, "Dropped leading zero bytes after direction release");
        }

        frame::decode_response(request, &frame).map_err(|status| {
            if status == ModbusStatus::InvalidCrc {
                warn!(rx = %hex_dump(&frame), "Modbus response with invalid CRC");
            }
            BusError::Transaction { status }
        })
    }
}

/// Exclusive use of the bus. Dropping it releases the bus.
pub struct BusGuard<'a> {
    bus: &'a ModbusBus,
}

impl BusGuard<'_> {
    /// Run one transaction.
    ///
    /// Read functions return the response words; writes return an empty
    /// vector. Non-success statuses count towards
    /// [`error_count`](ModbusBus::error_count).
    pub async fn execute(&self, request: &Request) -> Result<Vec<u16>, BusError> {
        self.bus.transact(request).await
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        self.bus.release();
    }
}
