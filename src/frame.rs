//! Modbus-RTU frame construction and response validation.
//!
//! Only the function codes the enclosure devices actually use are supported:
//! Read Holding Registers (`0x03`), Write Single Coil (`0x05`), Write Single
//! Register (`0x06`) and Write Multiple Registers (`0x10`).
//!
//! A frame on the wire is `[unit, function, data...]` followed by the CRC-16
//! of those bytes, low byte first. Register payloads are big-endian.
use crate::error::ProtocolError;
use crc::{Crc, CRC_16_MODBUS};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Smallest frame that can carry anything: unit, function and the CRC.
pub const MIN_FRAME_LEN: usize = 4;
/// Length of an exception response: unit, function | 0x80, code, CRC.
pub const EXCEPTION_FRAME_LEN: usize = 5;
/// Value of a Write Single Coil request that switches the coil on.
pub const COIL_ON: u16 = 0xFF00;
/// Value of a Write Single Coil request that switches the coil off.
pub const COIL_OFF: u16 = 0x0000;

/// Computes the Modbus CRC-16 (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC_MODBUS.checksum(bytes)
}

/// Returns `true` if the trailing two bytes of `frame` are the little-endian
/// CRC of everything before them.
pub fn crc_is_valid(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([crc[0], crc[1]])
}

/// Formats bytes as space separated hex for frame logging.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A Modbus unit (slave) id in the assignable range `1..=247`.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(u8);

impl UnitId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 247;

    pub fn new(unit: u8) -> Result<Self, crate::error::Error> {
        if (Self::MIN..=Self::MAX).contains(&unit) {
            Ok(Self(unit))
        } else {
            Err(crate::error::Error::UnitOutOfRange(unit))
        }
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self(1)
    }
}

impl std::ops::Deref for UnitId {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for UnitId {
    type Error = crate::error::Error;
    fn try_from(unit: u8) -> Result<Self, Self::Error> {
        Self::new(unit)
    }
}

impl From<UnitId> for u8 {
    fn from(unit: UnitId) -> Self {
        unit.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The supported Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The function byte of an exception response to this function.
    pub fn exception_code(self) -> u8 {
        self as u8 | 0x80
    }
}

/// An encoded request frame together with what is needed to validate its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    unit: u8,
    function: FunctionCode,
    /// Register count of a read request, used to check the reply's byte count.
    quantity: u16,
    bytes: Vec<u8>,
}

impl Request {
    fn build(unit: u8, function: FunctionCode, quantity: u16, data: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(data.len() + 4);
        bytes.push(unit);
        bytes.push(function.code());
        bytes.extend_from_slice(data);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Self {
            unit,
            function,
            quantity,
            bytes,
        }
    }

    /// `0x03` Read Holding Registers.
    pub fn read_holding_registers(unit: u8, start: u16, count: u16) -> Self {
        let mut data = [0u8; 4];
        data[..2].copy_from_slice(&start.to_be_bytes());
        data[2..].copy_from_slice(&count.to_be_bytes());
        Self::build(unit, FunctionCode::ReadHoldingRegisters, count, &data)
    }

    /// `0x06` Write Single Register.
    pub fn write_single_register(unit: u8, address: u16, value: u16) -> Self {
        let mut data = [0u8; 4];
        data[..2].copy_from_slice(&address.to_be_bytes());
        data[2..].copy_from_slice(&value.to_be_bytes());
        Self::build(unit, FunctionCode::WriteSingleRegister, 1, &data)
    }

    /// `0x05` Write Single Coil.
    pub fn write_single_coil(unit: u8, address: u16, on: bool) -> Self {
        let value = if on { COIL_ON } else { COIL_OFF };
        let mut data = [0u8; 4];
        data[..2].copy_from_slice(&address.to_be_bytes());
        data[2..].copy_from_slice(&value.to_be_bytes());
        Self::build(unit, FunctionCode::WriteSingleCoil, 1, &data)
    }

    /// `0x10` Write Multiple Registers from register values.
    pub fn write_multiple_registers(
        unit: u8,
        start: u16,
        values: &[u16],
    ) -> Result<Self, ProtocolError> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        let count = u16::try_from(values.len())
            .map_err(|_| ProtocolError::Malformed(format!("{} registers", values.len())))?;
        Self::raw_write_multiple(unit, start, count, &data)
    }

    /// `0x10` Write Multiple Registers from an already serialized payload.
    ///
    /// `data` must be exactly `2 * count` bytes and fit the one byte count field.
    pub fn raw_write_multiple(
        unit: u8,
        start: u16,
        count: u16,
        data: &[u8],
    ) -> Result<Self, ProtocolError> {
        let byte_count = usize::from(count) * 2;
        if data.len() != byte_count || byte_count > usize::from(u8::MAX) {
            return Err(ProtocolError::Malformed(format!(
                "write multiple registers: {} data bytes for {count} registers",
                data.len()
            )));
        }
        let mut payload = Vec::with_capacity(5 + data.len());
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.push(byte_count as u8);
        payload.extend_from_slice(data);
        Ok(Self::build(
            unit,
            FunctionCode::WriteMultipleRegisters,
            count,
            &payload,
        ))
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    /// The complete frame including CRC.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The length of a well-formed, non-exception reply to this request.
    pub fn expected_response_len(&self) -> usize {
        match self.function {
            FunctionCode::ReadHoldingRegisters => 5 + usize::from(self.quantity) * 2,
            FunctionCode::WriteSingleCoil
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters => 8,
        }
    }
}

/// A validated reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Register values returned by Read Holding Registers.
    Registers(Vec<u16>),
    /// A write was acknowledged.
    Written,
}

impl Response {
    /// The registers of a read reply. A write acknowledge has none.
    pub fn into_registers(self) -> Vec<u16> {
        match self {
            Response::Registers(registers) => registers,
            Response::Written => Vec::new(),
        }
    }
}

/// Returns `true` once `buffer` holds a complete exception reply to `function`.
pub fn is_exception_frame(function: FunctionCode, buffer: &[u8]) -> bool {
    buffer.len() >= EXCEPTION_FRAME_LEN && buffer[1] == function.exception_code()
}

/// Validates `bytes` as the reply to `request`.
///
/// The address and function bytes decide whether the reply is ours at all
/// (otherwise [`ProtocolError::NoAck`]); everything after that must be
/// consistent or the reply is [`ProtocolError::Malformed`].
pub fn decode_response(request: &Request, bytes: &[u8]) -> Result<Response, ProtocolError> {
    let no_ack = || ProtocolError::NoAck {
        expected: request.expected_response_len(),
        received: bytes.to_vec(),
    };
    if bytes.len() < MIN_FRAME_LEN || bytes[0] != request.unit {
        return Err(no_ack());
    }
    if bytes[1] == request.function.exception_code() {
        if bytes.len() < EXCEPTION_FRAME_LEN || !crc_is_valid(&bytes[..EXCEPTION_FRAME_LEN]) {
            return Err(ProtocolError::Malformed(format!(
                "exception response {}",
                hex(bytes)
            )));
        }
        return Err(ProtocolError::Exception {
            function: request.function.code(),
            code: bytes[2],
        });
    }
    if bytes[1] != request.function.code() {
        return Err(no_ack());
    }

    let expected = request.expected_response_len();
    if bytes.len() < expected {
        return Err(no_ack());
    }
    let frame = &bytes[..expected];
    if !crc_is_valid(frame) {
        return Err(ProtocolError::Malformed(format!("CRC mismatch in {}", hex(frame))));
    }

    match request.function {
        FunctionCode::ReadHoldingRegisters => {
            let byte_count = usize::from(frame[2]);
            if byte_count != usize::from(request.quantity) * 2 {
                return Err(ProtocolError::Malformed(format!(
                    "byte count {byte_count} for {} registers",
                    request.quantity
                )));
            }
            Ok(Response::Registers(
                frame[3..3 + byte_count]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            ))
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            // The reply echoes address and value.
            if frame[2..6] != request.bytes[2..6] {
                return Err(ProtocolError::Malformed(format!(
                    "echo {} does not match request {}",
                    hex(frame),
                    hex(&request.bytes)
                )));
            }
            Ok(Response::Written)
        }
        FunctionCode::WriteMultipleRegisters => {
            // The reply echoes start address and register count.
            if frame[2..6] != request.bytes[2..6] {
                return Err(ProtocolError::Malformed(format!(
                    "echo {} does not match request {}",
                    hex(frame),
                    hex(&request.bytes[..7])
                )));
            }
            Ok(Response::Written)
        }
    }
}

/// Builds the reply a well-behaved device would send. Used by the test doubles.
#[cfg(test)]
pub(crate) fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16(body).to_le_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn unit_id_range() {
        assert_matches!(UnitId::new(0), Err(crate::error::Error::UnitOutOfRange(0)));
        assert_eq!(*UnitId::new(1).unwrap(), 1);
        assert_eq!(*UnitId::new(247).unwrap(), 247);
        assert_matches!(UnitId::try_from(248), Err(crate::error::Error::UnitOutOfRange(248)));
        assert_eq!(*UnitId::default(), 1);
    }

    #[test]
    fn crc_known_vectors() {
        // Read holding register 0x0058 from unit 1, as sent by the motor probe.
        let request = Request::read_holding_registers(1, 0x0058, 1);
        assert_eq!(request.as_bytes(), &[0x01, 0x03, 0x00, 0x58, 0x00, 0x01, 0x05, 0xD9]);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn crc_round_trip() {
        for body in [
            vec![0x01],
            vec![0x01, 0x06, 0x00, 0x04, 0x05, 0x00],
            (0u8..=255).collect::<Vec<_>>(),
        ] {
            let frame = with_crc(&body);
            assert!(crc_is_valid(&frame));
            let (payload, tail) = frame.split_at(frame.len() - 2);
            assert_eq!(crc16(payload).to_le_bytes(), [tail[0], tail[1]]);
        }
        let mut corrupted = with_crc(&[0x01, 0x03, 0x02, 0x00, 0xA0]);
        corrupted[3] ^= 0x01;
        assert!(!crc_is_valid(&corrupted));
    }

    #[test]
    fn request_shapes() {
        let write = Request::write_single_register(1, 6, 0x0400);
        assert_eq!(&write.as_bytes()[..6], &[0x01, 0x06, 0x00, 0x06, 0x04, 0x00]);
        assert_eq!(write.expected_response_len(), 8);

        let coil = Request::write_single_coil(1, 0x0087, true);
        assert_eq!(&coil.as_bytes()[..6], &[0x01, 0x05, 0x00, 0x87, 0xFF, 0x00]);

        let multiple = Request::write_multiple_registers(1, 0x0010, &[0x0102, 0x0304]).unwrap();
        assert_eq!(
            &multiple.as_bytes()[..11],
            &[0x01, 0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04]
        );
        assert!(crc_is_valid(multiple.as_bytes()));

        let read = Request::read_holding_registers(1, 0, 4);
        assert_eq!(read.expected_response_len(), 13);
    }

    #[test]
    fn raw_write_multiple_checks_byte_count() {
        assert_matches!(
            Request::raw_write_multiple(1, 0x58, 18, &[0u8; 32]),
            Err(ProtocolError::Malformed(..))
        );
        assert_matches!(
            Request::raw_write_multiple(1, 0x58, 200, &[0u8; 400]),
            Err(ProtocolError::Malformed(..))
        );
        let request = Request::raw_write_multiple(1, 0x58, 16, &[0u8; 32]).unwrap();
        assert_eq!(request.as_bytes().len(), 7 + 32 + 2);
    }

    #[test]
    fn decode_read_response() {
        let request = Request::read_holding_registers(1, 12, 1);
        let reply = with_crc(&[0x01, 0x03, 0x02, 0xFF, 0x9C]);
        assert_eq!(
            decode_response(&request, &reply),
            Ok(Response::Registers(vec![0xFF9C]))
        );

        // Trailing noise after a complete frame is ignored.
        let mut noisy = reply.clone();
        noisy.push(0x00);
        assert_matches!(decode_response(&request, &noisy), Ok(Response::Registers(..)));

        let wrong_count = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x01]);
        assert_matches!(
            decode_response(&request, &wrong_count),
            Err(ProtocolError::NoAck { .. } | ProtocolError::Malformed(..))
        );
    }

    #[test]
    fn decode_rejects_foreign_and_short_replies() {
        let request = Request::read_holding_registers(1, 4, 1);
        assert_matches!(decode_response(&request, &[]), Err(ProtocolError::NoAck { .. }));
        assert_matches!(
            decode_response(&request, &[0x01, 0x03]),
            Err(ProtocolError::NoAck { .. })
        );
        let other_unit = with_crc(&[0x02, 0x03, 0x02, 0x00, 0x00]);
        assert_matches!(
            decode_response(&request, &other_unit),
            Err(ProtocolError::NoAck { .. })
        );
        let other_function = with_crc(&[0x01, 0x04, 0x02, 0x00, 0x00]);
        assert_matches!(
            decode_response(&request, &other_function),
            Err(ProtocolError::NoAck { .. })
        );
        let mut bad_crc = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x00]);
        bad_crc[6] ^= 0xFF;
        assert_matches!(
            decode_response(&request, &bad_crc),
            Err(ProtocolError::Malformed(..))
        );
    }

    #[test]
    fn decode_write_echo_and_exception() {
        let request = Request::write_single_register(1, 4, 0x0400);
        assert_eq!(
            decode_response(&request, request.as_bytes()),
            Ok(Response::Written)
        );

        let other_value = Request::write_single_register(1, 4, 0x0500);
        assert_matches!(
            decode_response(&request, other_value.as_bytes()),
            Err(ProtocolError::Malformed(..))
        );

        let exception = with_crc(&[0x01, 0x86, 0x02]);
        assert_eq!(
            decode_response(&request, &exception),
            Err(ProtocolError::Exception {
                function: 0x06,
                code: 0x02
            })
        );
        assert!(is_exception_frame(FunctionCode::WriteSingleRegister, &exception));
        assert!(!is_exception_frame(FunctionCode::ReadHoldingRegisters, &exception));
    }

    #[test]
    fn decode_write_multiple_ack() {
        let request = Request::write_multiple_registers(1, 0x0058, &[0; 18]).unwrap();
        let ack = with_crc(&[0x01, 0x10, 0x00, 0x58, 0x00, 0x12]);
        assert_eq!(decode_response(&request, &ack), Ok(Response::Written));
    }
}
