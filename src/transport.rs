//! Half-duplex RS-485 transport.
//!
//! A [`SerialTransport`] exclusively owns one open serial port. Every
//! transaction (drain, write, settle, read) runs under one mutex because
//! Modbus RTU is strictly request/response: a second request must never be
//! put on the wire before the first reply has been read.
//!
//! The device models only see the [`Transport`] trait, so they can borrow a
//! `&SerialTransport` in production and a scripted double in tests.
use crate::error::{Result, TransportError};
use crate::frame::{self, Request, Response, UnitId};
use log::*;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_serial::SerialPort;

/// Settle time after clearing the buffers and before writing a request.
pub const PRE_WRITE_SETTLE: Duration = Duration::from_millis(20);
/// Settle time after writing a request and before reading the reply.
pub const POST_WRITE_SETTLE: Duration = Duration::from_millis(50);
/// Upper bound of one blocking read inside the reply loop.
const READ_POLL_STEP: Duration = Duration::from_millis(20);

/// Parity of the serial line.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Number of stop bits of the serial line.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Number of data bits of the serial line.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(data_bits: DataBits) -> Self {
        match data_bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// How the transceiver's transmit/receive direction is switched.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionControl {
    /// The adapter or its driver switches direction on its own. RTS stays
    /// deasserted (receive) and the delays are honoured around each write.
    Auto {
        #[cfg_attr(feature = "serde", serde(with = "humantime_serde", default))]
        delay_before_tx: Duration,
        #[cfg_attr(feature = "serde", serde(with = "humantime_serde", default))]
        delay_before_rx: Duration,
    },
    /// RTS is asserted while transmitting and deasserted for receiving.
    Rts,
}

impl Default for DirectionControl {
    fn default() -> Self {
        let delay = if cfg!(target_os = "windows") {
            Duration::ZERO
        } else {
            Duration::from_millis(5)
        };
        DirectionControl::Auto {
            delay_before_tx: delay,
            delay_before_rx: delay,
        }
    }
}

/// Everything needed to open one device port.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    /// Serial port device, e.g. `/dev/ttyUSB0` or `COM10`.
    pub device: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub data_bits: DataBits,
    /// Deadline for a device reply.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub timeout: Duration,
    /// Modbus unit (slave) id of the device.
    pub unit: UnitId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub direction: DirectionControl,
}

impl SerialSettings {
    /// AC controller defaults: 19200 baud, 8E1, 2 s reply deadline, unit 1.
    pub fn ac_controller(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: 19200,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            data_bits: DataBits::Eight,
            timeout: Duration::from_secs(2),
            unit: UnitId::default(),
            direction: DirectionControl::default(),
        }
    }

    /// Motor driver defaults: 9600 baud, 8N1, 1.5 s reply deadline, unit 1.
    pub fn motor(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            data_bits: DataBits::Eight,
            timeout: Duration::from_millis(1500),
            unit: UnitId::default(),
            direction: DirectionControl::default(),
        }
    }

    /// A copy of these settings at another baud rate.
    pub fn with_baud_rate(&self, baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..self.clone()
        }
    }
}

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
pub fn serial_port_builder(settings: &SerialSettings) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(&settings.device, settings.baud_rate)
        .parity(settings.parity.into())
        .stop_bits(settings.stop_bits.into())
        .data_bits(settings.data_bits.into())
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(settings.timeout)
}

/// One request/response channel to a device.
pub trait Transport {
    /// Sends `request` and collects reply bytes until the expected reply
    /// length, a complete exception frame, or `deadline`. The bytes are
    /// returned unvalidated and may be empty.
    fn transact(
        &self,
        request: &Request,
        deadline: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError>;

    /// Discards anything pending in the input and output buffers.
    fn drain(&self) -> std::result::Result<(), TransportError>;

    /// The default reply deadline of this channel.
    fn timeout(&self) -> Duration;

    /// Sends `request` and validates the reply.
    fn execute(&self, request: &Request) -> Result<Response> {
        let reply = self.transact(request, self.timeout())?;
        Ok(frame::decode_response(request, &reply)?)
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn transact(
        &self,
        request: &Request,
        deadline: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        (**self).transact(request, deadline)
    }

    fn drain(&self) -> std::result::Result<(), TransportError> {
        (**self).drain()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn transact(
        &self,
        request: &Request,
        deadline: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        (**self).transact(request, deadline)
    }

    fn drain(&self) -> std::result::Result<(), TransportError> {
        (**self).drain()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }
}

/// The single owner of one open serial port.
pub struct SerialTransport {
    device: String,
    baud_rate: u32,
    timeout: Duration,
    direction: DirectionControl,
    port: Mutex<Option<Box<dyn SerialPort>>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("device", &self.device)
            .field("baud_rate", &self.baud_rate)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Opens and configures the port described by `settings`.
    pub fn open(settings: &SerialSettings) -> std::result::Result<Self, TransportError> {
        let open_error = |source| TransportError::Open {
            device: settings.device.clone(),
            source,
        };
        let port = serial_port_builder(settings).open().map_err(open_error)?;
        Self::from_port(port, settings).map_err(open_error)
    }

    /// Takes over an already opened `port`, configured as in `settings`.
    ///
    /// The line is put into receive direction. Only [`DirectionControl::Rts`]
    /// requires an RTS line; in automatic mode a port without modem control
    /// lines is accepted.
    pub fn from_port(
        mut port: Box<dyn SerialPort>,
        settings: &SerialSettings,
    ) -> std::result::Result<Self, tokio_serial::Error> {
        if let Err(error) = port.write_request_to_send(false) {
            match settings.direction {
                DirectionControl::Rts => return Err(error),
                DirectionControl::Auto { .. } => {
                    warn!("Cannot deassert RTS on {}: {error}", settings.device)
                }
            }
        }
        port.clear(tokio_serial::ClearBuffer::All)?;
        info!(
            "Opened {} at {} baud ({:?})",
            settings.device, settings.baud_rate, settings.direction
        );
        Ok(Self {
            device: settings.device.clone(),
            baud_rate: settings.baud_rate,
            timeout: settings.timeout,
            direction: settings.direction,
            port: Mutex::new(Some(port)),
        })
    }

    /// Opens the port at each of `baud_rates` in turn and returns the first
    /// transport for which `probe` reports a live device, with its baud rate.
    pub fn open_autobaud<F>(
        settings: &SerialSettings,
        baud_rates: &[u32],
        mut probe: F,
    ) -> std::result::Result<(Self, u32), TransportError>
    where
        F: FnMut(&SerialTransport) -> bool,
    {
        for &baud_rate in baud_rates {
            match Self::open(&settings.with_baud_rate(baud_rate)) {
                Ok(transport) => {
                    if probe(&transport) {
                        info!("Device on {} answers at {baud_rate} baud", settings.device);
                        return Ok((transport, baud_rate));
                    }
                    debug!("No answer on {} at {baud_rate} baud", settings.device);
                    transport.close();
                }
                Err(error) => {
                    debug!("Cannot open {} at {baud_rate} baud: {error}", settings.device)
                }
            }
        }
        Err(TransportError::Open {
            device: settings.device.clone(),
            source: tokio_serial::Error::new(
                tokio_serial::ErrorKind::NoDevice,
                format!("no response at any of {baud_rates:?} baud"),
            ),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Closes the port. Closing an already closed transport does nothing.
    pub fn close(&self) {
        if self.lock().take().is_some() {
            info!("Closed {}", self.device);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn SerialPort>>> {
        // A panic while holding the lock leaves the port itself usable.
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_frame(
        &self,
        port: &mut dyn SerialPort,
        bytes: &[u8],
    ) -> std::result::Result<(), TransportError> {
        match self.direction {
            DirectionControl::Rts => {
                port.write_request_to_send(true)?;
                let written = port.write_all(bytes).and_then(|()| port.flush());
                // Always hand the line back, even if the write failed.
                let released = port.write_request_to_send(false);
                rts_write_outcome(&self.device, written, released)?;
            }
            DirectionControl::Auto {
                delay_before_tx,
                delay_before_rx,
            } => {
                std::thread::sleep(delay_before_tx);
                port.write_all(bytes)?;
                port.flush()?;
                std::thread::sleep(delay_before_rx);
            }
        }
        Ok(())
    }
}

/// A failed write is reported before a failure to release RTS, which is
/// only logged then.
fn rts_write_outcome(
    device: &str,
    written: std::io::Result<()>,
    released: std::result::Result<(), tokio_serial::Error>,
) -> std::result::Result<(), TransportError> {
    match (written, released) {
        (Err(error), Err(release_error)) => {
            warn!("Cannot deassert RTS on {device}: {release_error}");
            Err(error.into())
        }
        (written, released) => {
            written?;
            released?;
            Ok(())
        }
    }
}

fn read_reply(
    port: &mut dyn SerialPort,
    request: &Request,
    deadline: Duration,
) -> std::result::Result<Vec<u8>, TransportError> {
    let expected = request.expected_response_len();
    let started = Instant::now();
    let mut reply = Vec::with_capacity(expected);
    let mut chunk = [0u8; 256];
    while reply.len() < expected && !frame::is_exception_frame(request.function(), &reply) {
        let remaining = match deadline.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => break,
        };
        port.set_timeout(remaining.min(READ_POLL_STEP))?;
        let want = (expected - reply.len()).min(chunk.len());
        match port.read(&mut chunk[..want]) {
            Ok(n) => reply.extend_from_slice(&chunk[..n]),
            Err(error) if matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(reply)
}

impl Transport for SerialTransport {
    fn transact(
        &self,
        request: &Request,
        deadline: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let mut guard = self.lock();
        let port = guard.as_mut().ok_or(TransportError::Closed)?;
        port.clear(tokio_serial::ClearBuffer::All)?;
        std::thread::sleep(PRE_WRITE_SETTLE);

        trace!("{} TX {}", self.device, frame::hex(request.as_bytes()));
        self.write_frame(&mut **port, request.as_bytes())?;
        std::thread::sleep(POST_WRITE_SETTLE);

        let reply = read_reply(&mut **port, request, deadline)?;
        trace!("{} RX {}", self.device, frame::hex(&reply));
        Ok(reply)
    }

    fn drain(&self) -> std::result::Result<(), TransportError> {
        let mut guard = self.lock();
        let port = guard.as_mut().ok_or(TransportError::Closed)?;
        port.clear(tokio_serial::ClearBuffer::All)?;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
