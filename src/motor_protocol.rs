//! Register layout and command encoding of the cover motor driver.
//!
//! The driver is commanded with a single fixed-length Write Multiple
//! Registers frame that carries the target angle together with fixed speed,
//! current and ramp parameters. Two firmware generations are known; they
//! differ in payload length and angle resolution. Both are described by a
//! [`MotorFirmware`] value chosen when the driver is created.
use crate::error::{Error, ProtocolError, Result};
use crate::frame::{self, FunctionCode, Request};

/// First register of the motion command block; also the register read by
/// the baud rate probe.
pub const MOVE_START_REGISTER: u16 = 0x0058;
/// Speed written with every move.
pub const TRACKER_SPEED: i32 = 100;
/// Motor current written with every move.
pub const TRACKER_CURRENT: i32 = 100;
/// Acceleration ramp.
pub const ACCELERATION: i32 = 8000;
/// Deceleration ramp.
pub const DECELERATION: i32 = 8000;
/// The two trigger words closing the command block.
pub const TRIGGER: [i32; 2] = [1, 1];

/// Baud rates tried, in order, when scanning for the driver.
pub const BAUD_RATE_CANDIDATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

pub const STOP_REGISTER: u16 = 0x007D;
pub const STOP_VALUE: u16 = 0x0020;
pub const CLEAR_ALARM_COIL: u16 = 0x0087;
pub const STATUS_REGISTER: u16 = 0x007F;
pub const STATUS_MOVING_BIT: u8 = 0;
pub const RAIN_INPUT_REGISTER: u16 = 0x00D5;
pub const RAIN_BIT: u8 = 2;

/// Replies seen from some drivers instead of a write-multiple echo. They are
/// accepted as acknowledgements of a move and nothing else.
pub const COMPAT_ACK_PREFIXES: &[&[u8]] = &[&[0x7E, 0x25], &[0x01, 0x90, 0x04, 0x4D, 0xC3]];

/// The known firmware generations.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FirmwareGeneration {
    /// 18 registers (36 bytes), angle in whole units.
    #[default]
    Gen1,
    /// 16 registers (32 bytes), angle in tenths.
    Gen2,
}

/// Command layout and control addresses of one firmware generation.
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "FirmwareGeneration"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorFirmware {
    pub generation: FirmwareGeneration,
    pub start_register: u16,
    pub register_count: u16,
    /// Encoded angle per unit of commanded angle.
    pub angle_scale: i32,
    pub ack_prefixes: &'static [&'static [u8]],
    pub stop_register: u16,
    pub stop_value: u16,
    pub clear_alarm_coil: u16,
    pub status_register: u16,
    pub rain_register: u16,
}

impl MotorFirmware {
    pub fn gen1() -> Self {
        Self {
            generation: FirmwareGeneration::Gen1,
            start_register: MOVE_START_REGISTER,
            register_count: 18,
            angle_scale: 1,
            ack_prefixes: COMPAT_ACK_PREFIXES,
            stop_register: STOP_REGISTER,
            stop_value: STOP_VALUE,
            clear_alarm_coil: CLEAR_ALARM_COIL,
            status_register: STATUS_REGISTER,
            rain_register: RAIN_INPUT_REGISTER,
        }
    }

    pub fn gen2() -> Self {
        Self {
            generation: FirmwareGeneration::Gen2,
            register_count: 16,
            angle_scale: 10,
            ..Self::gen1()
        }
    }

    /// Payload length of the move command in bytes.
    pub fn byte_count(&self) -> usize {
        usize::from(self.register_count) * 2
    }

    /// The command block for `angle`, zero padded to [`Self::byte_count`].
    pub fn move_payload(&self, angle: i32) -> Result<Vec<u8>> {
        let encoded = angle
            .checked_mul(self.angle_scale)
            .ok_or(Error::AngleOutOfRange(angle))?;
        let words = [
            encoded,
            TRACKER_SPEED,
            ACCELERATION,
            DECELERATION,
            TRACKER_CURRENT,
            TRIGGER[0],
            TRIGGER[1],
        ];
        let mut payload: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
        payload.resize(self.byte_count(), 0);
        Ok(payload)
    }

    /// The complete Write Multiple Registers request moving unit `unit` to `angle`.
    pub fn encode_move(&self, unit: u8, angle: i32) -> Result<Request> {
        let payload = self.move_payload(angle)?;
        Ok(Request::raw_write_multiple(
            unit,
            self.start_register,
            self.register_count,
            &payload,
        )?)
    }

    /// Classifies the reply to a move command.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Exception`] for a well-formed exception frame that is
    /// not an accepted prefix, [`ProtocolError::NoAck`] for anything else.
    pub fn classify_ack(&self, unit: u8, reply: &[u8]) -> std::result::Result<Ack, ProtocolError> {
        if reply.len() >= 3
            && reply[0] == unit
            && reply[1] == FunctionCode::WriteMultipleRegisters.code()
        {
            return Ok(Ack::Standard);
        }
        if let Some(prefix) = self
            .ack_prefixes
            .iter()
            .find(|prefix| reply.starts_with(prefix))
        {
            return Ok(Ack::Compat(*prefix));
        }
        if reply.len() == frame::EXCEPTION_FRAME_LEN
            && reply[0] == unit
            && frame::is_exception_frame(FunctionCode::WriteMultipleRegisters, reply)
            && frame::crc_is_valid(reply)
        {
            return Err(ProtocolError::Exception {
                function: reply[1],
                code: reply[2],
            });
        }
        Err(ProtocolError::NoAck {
            expected: frame::MIN_FRAME_LEN,
            received: reply.to_vec(),
        })
    }
}

impl Default for MotorFirmware {
    fn default() -> Self {
        Self::gen1()
    }
}

impl From<FirmwareGeneration> for MotorFirmware {
    fn from(generation: FirmwareGeneration) -> Self {
        match generation {
            FirmwareGeneration::Gen1 => Self::gen1(),
            FirmwareGeneration::Gen2 => Self::gen2(),
        }
    }
}

/// How a move command was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The regular `[unit, 0x10, ..]` echo.
    Standard,
    /// One of the accepted alternate replies.
    Compat(&'static [u8]),
}

impl std::fmt::Display for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ack::Standard => write!(f, "ack"),
            Ack::Compat(prefix) => write!(f, "ack ({})", frame::hex(prefix)),
        }
    }
}

/// Whether the operating status word reports motion.
pub fn busy_from_status(status: u16) -> bool {
    status & (1 << STATUS_MOVING_BIT) != 0
}

/// Whether the rain input word reports rain. Only the low byte carries inputs.
pub fn rain_from_status(status: u16) -> bool {
    (status & 0x00FF) & (1 << RAIN_BIT) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::with_crc;
    use assert_matches::assert_matches;

    #[test]
    fn gen1_move_frame() {
        let request = MotorFirmware::gen1().encode_move(1, -2250).unwrap();
        let bytes = request.as_bytes();
        assert_eq!(&bytes[..7], &[0x01, 0x10, 0x00, 0x58, 0x00, 0x12, 0x24]);
        let payload = &bytes[7..bytes.len() - 2];
        assert_eq!(payload.len(), 36);
        assert_eq!(&payload[..4], &(-2250i32).to_be_bytes());
        assert_eq!(&payload[4..8], &[0x00, 0x00, 0x00, 0x64]);
        assert_eq!(
            &payload[8..16],
            &[0x00, 0x00, 0x1F, 0x40, 0x00, 0x00, 0x1F, 0x40]
        );
        assert_eq!(&payload[16..20], &[0x00, 0x00, 0x00, 0x64]);
        assert_eq!(
            &payload[20..28],
            &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01]
        );
        assert!(payload[28..].iter().all(|b| *b == 0));
        assert_eq!(bytes.len(), 7 + 36 + 2);
        assert!(frame::crc_is_valid(bytes));
    }

    #[test]
    fn gen2_move_frame() {
        let firmware = MotorFirmware::from(FirmwareGeneration::Gen2);
        let request = firmware.encode_move(1, -30).unwrap();
        let bytes = request.as_bytes();
        assert_eq!(&bytes[..7], &[0x01, 0x10, 0x00, 0x58, 0x00, 0x10, 0x20]);
        assert_eq!(&bytes[7..11], &(-300i32).to_be_bytes());
        assert_eq!(bytes.len(), 7 + 32 + 2);
        assert!(frame::crc_is_valid(bytes));
    }

    #[test]
    fn move_angle_overflow() {
        assert_matches!(
            MotorFirmware::gen2().encode_move(1, i32::MAX),
            Err(Error::AngleOutOfRange(i32::MAX))
        );
        assert!(MotorFirmware::gen1().encode_move(1, i32::MAX).is_ok());
    }

    #[test]
    fn acknowledgements() {
        let firmware = MotorFirmware::gen1();
        let echo = with_crc(&[0x01, 0x10, 0x00, 0x58, 0x00, 0x12]);
        assert_eq!(firmware.classify_ack(1, &echo), Ok(Ack::Standard));
        assert_eq!(firmware.classify_ack(1, &echo[..3]), Ok(Ack::Standard));

        assert_eq!(
            firmware.classify_ack(1, &[0x7E, 0x25, 0x00]),
            Ok(Ack::Compat(&[0x7E, 0x25]))
        );
        assert_eq!(
            firmware.classify_ack(1, &[0x01, 0x90, 0x04, 0x4D, 0xC3]),
            Ok(Ack::Compat(&[0x01, 0x90, 0x04, 0x4D, 0xC3]))
        );
    }

    #[test]
    fn rejected_acknowledgements() {
        let firmware = MotorFirmware::gen1();
        assert_matches!(
            firmware.classify_ack(1, &[]),
            Err(ProtocolError::NoAck { received, .. }) if received.is_empty()
        );
        assert_matches!(
            firmware.classify_ack(1, &[0x02, 0x10, 0x00]),
            Err(ProtocolError::NoAck { .. })
        );
        assert_matches!(
            firmware.classify_ack(1, &[0x7E]),
            Err(ProtocolError::NoAck { received, .. }) if received == vec![0x7E]
        );
        assert_matches!(
            firmware.classify_ack(1, &with_crc(&[0x01, 0x90, 0x02])),
            Err(ProtocolError::Exception { function: 0x90, code: 0x02 })
        );
    }

    #[test]
    fn status_bits() {
        assert!(busy_from_status(0x0001));
        assert!(!busy_from_status(0x0002));
        // Two observed payloads of the rain input register.
        assert!(rain_from_status(0x0004));
        assert!(!rain_from_status(0x0000));
        assert!(!rain_from_status(0x0400));
        assert!(rain_from_status(0xFF05));
    }
}
