//! Error types shared by the transport, the frame codec and the device models.
//!
//! The taxonomy follows the failure domains of a half-duplex RS-485 session:
//! the port itself ([`TransportError`]), the bytes coming back from a device
//! ([`ProtocolError`]) and the values a caller asked for ([`Error::InvalidRange`]).
use crate::ac_protocol::SetpointQuad;

/// Failures of the serial port itself. Fatal to the device session; the
/// caller may reconnect, nothing reconnects automatically.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The serial port could not be opened or configured.
    #[error("Cannot open serial port {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// A transaction was attempted after [`crate::transport::SerialTransport::close`].
    #[error("Serial port is closed")]
    Closed,

    /// Wraps `std::io::Error` raised while writing or reading.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps `tokio_serial::Error` raised while configuring an open port.
    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),
}

/// The response of a device was missing or could not be accepted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Nothing usable came back: an empty or short read, or a reply from the
    /// wrong unit or for the wrong function.
    #[error("No acknowledge from device (expected {expected} bytes, received {received:02X?})")]
    NoAck { expected: usize, received: Vec<u8> },

    /// A reply addressed to us that fails validation (CRC, byte count, echo).
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The device answered with a Modbus exception response.
    #[error("Device exception: function 0x{function:02X}, exception code 0x{code:02X}")]
    Exception { function: u8, code: u8 },
}

/// Represents all possible errors of the device operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Wraps [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The derived setpoints violate the clamp ranges or the ordering
    /// `low < heater - 1 < cooling - 1 < high - 1`. Nothing was written.
    #[error("Setpoints out of range: {0}")]
    InvalidRange(SetpointQuad),

    /// A unit id outside the assignable range `1..=247`.
    #[error("Unit id {0} is outside 1..=247")]
    UnitOutOfRange(u8),

    /// The commanded angle does not fit the firmware's angle encoding.
    #[error("Angle {0} cannot be encoded by the motor firmware")]
    AngleOutOfRange(i32),

    /// Every candidate address for the enable flags rejected the write.
    #[error("Writing enable flags failed at every candidate address {candidates:?}")]
    WriteFailed {
        candidates: Vec<u16>,
        #[source]
        source: Box<Error>,
    },
}

/// The result type of the device operations.
pub type Result<T> = std::result::Result<T, Error>;
