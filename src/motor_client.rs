//! Blocking client for the cover motor driver.
//!
//! ## Example
//!
//! ```no_run
//! use domectl_lib::motor_client::MotorDriver;
//! use domectl_lib::motor_protocol::MotorFirmware;
//! use domectl_lib::transport::SerialSettings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = SerialSettings::motor("/dev/ttyUSB0");
//!     let (motor, baud_rate) = MotorDriver::connect_autobaud(&settings, MotorFirmware::gen1())?;
//!     println!("Motor answers at {baud_rate} baud");
//!
//!     motor.move_to(-2250)?;
//!     if motor.check_rain_status()? {
//!         motor.move_to(0)?;
//!     }
//!     Ok(())
//! }
//! ```
use crate::error::{ProtocolError, Result};
use crate::frame::{self, Request};
use crate::motor_protocol::{self as proto, Ack, MotorFirmware};
use crate::transport::{SerialSettings, SerialTransport, Transport};
use log::*;
use std::time::Duration;

/// Upper bound for collecting the reply to a move command.
pub const MOVE_REPLY_DEADLINE: Duration = Duration::from_millis(500);
/// Upper bound for the reply to the probe read.
pub const PROBE_DEADLINE: Duration = Duration::from_millis(500);

/// Synchronous client for one motor driver unit.
#[derive(Debug)]
pub struct MotorDriver<T> {
    transport: T,
    unit: u8,
    firmware: MotorFirmware,
}

impl MotorDriver<SerialTransport> {
    /// Scans [`proto::BAUD_RATE_CANDIDATES`] and returns a driver on the
    /// first baud rate at which the unit answers the probe read.
    pub fn connect_autobaud(
        settings: &SerialSettings,
        firmware: MotorFirmware,
    ) -> Result<(Self, u32)> {
        let unit = *settings.unit;
        let (transport, baud_rate) =
            SerialTransport::open_autobaud(settings, &proto::BAUD_RATE_CANDIDATES, |transport| {
                MotorDriver::new(transport, unit, firmware.clone())
                    .probe()
                    .is_ok()
            })?;
        Ok((Self::new(transport, unit, firmware), baud_rate))
    }
}

impl<T: Transport> MotorDriver<T> {
    pub fn new(transport: T, unit: u8, firmware: MotorFirmware) -> Self {
        Self {
            transport,
            unit,
            firmware,
        }
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn firmware(&self) -> &MotorFirmware {
        &self.firmware
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Commands a move to `angle`. Returns once the driver acknowledged the
    /// command, not when the move is finished; see [`Self::is_busy`].
    pub fn move_to(&self, angle: i32) -> Result<Ack> {
        let request = self.firmware.encode_move(self.unit, angle)?;
        let reply = self.transport.transact(&request, MOVE_REPLY_DEADLINE)?;
        match self.firmware.classify_ack(self.unit, &reply) {
            Ok(ack) => {
                info!("Motor unit {}: move to {angle} accepted ({ack})", self.unit);
                Ok(ack)
            }
            Err(error) => {
                debug!(
                    "Motor unit {}: move to {angle} not acknowledged, reply [{}]",
                    self.unit,
                    frame::hex(&reply)
                );
                Err(error.into())
            }
        }
    }

    fn control(&self, request: Request, what: &str) -> bool {
        match self.transport.execute(&request) {
            Ok(_) => {
                debug!("Motor unit {}: {what} sent", self.unit);
                true
            }
            Err(error) => {
                warn!("Motor unit {}: {what} failed: {error}", self.unit);
                false
            }
        }
    }

    /// Requests a decelerated stop. Best effort.
    pub fn stop(&self) -> bool {
        let request = Request::write_single_register(
            self.unit,
            self.firmware.stop_register,
            self.firmware.stop_value,
        );
        self.control(request, "stop")
    }

    /// Clears a latched driver alarm. Best effort.
    pub fn clear_alarm(&self) -> bool {
        let request = Request::write_single_coil(self.unit, self.firmware.clear_alarm_coil, true);
        self.control(request, "alarm clear")
    }

    fn read_register(&self, address: u16, deadline: Duration) -> Result<u16> {
        let request = Request::read_holding_registers(self.unit, address, 1);
        let reply = self.transport.transact(&request, deadline)?;
        frame::decode_response(&request, &reply)?
            .into_registers()
            .first()
            .copied()
            .ok_or_else(|| ProtocolError::Malformed("empty register read".into()).into())
    }

    /// Whether the driver reports motion. A failed status read counts as
    /// "not busy".
    pub fn is_busy(&self) -> bool {
        match self.read_register(self.firmware.status_register, self.transport.timeout()) {
            Ok(status) => proto::busy_from_status(status),
            Err(error) => {
                debug!(
                    "Motor unit {}: status read failed, reporting idle: {error}",
                    self.unit
                );
                false
            }
        }
    }

    /// Reads the rain sensor input wired to the driver.
    pub fn check_rain_status(&self) -> Result<bool> {
        let word = self.read_register(self.firmware.rain_register, self.transport.timeout())?;
        Ok(proto::rain_from_status(word))
    }

    /// Reads the first command register to check that the unit answers.
    pub fn probe(&self) -> Result<()> {
        self.read_register(self.firmware.start_register, PROBE_DEADLINE)?;
        Ok(())
    }

    /// Discards anything pending in the transport buffers.
    pub fn drain(&self) -> Result<()> {
        Ok(self.transport.drain()?)
    }
}
