//! A library for the RS-485 instruments of an observation enclosure: the AC
//! controller that keeps the enclosure tempered and the motor driver that
//! opens and closes its cover.
//!
//! Both devices speak a Modbus-RTU dialect over half-duplex serial lines.
//! The crate is layered:
//!
//! 1.  **Wire**: [`frame`] builds and validates frames, [`transport`] owns a
//!     serial port and runs one request/response transaction at a time.
//! 2.  **Device models**: [`ac_protocol`] and [`motor_protocol`] describe the
//!     registers and bit fields, [`ac_client`] and [`motor_client`] turn them
//!     into device operations over any [`transport::Transport`].
//! 3.  **Sharing and pacing**: [`ac_safe_client::SafeAcClient`] serializes a
//!     poll loop and a command path on one AC unit, [`pacer::MotionPacer`]
//!     spaces, retries and time-boxes motor moves. With the `async` feature,
//!     [`async_client::AsyncAcClient`] offers the AC operations as futures.
//!
//! ## Quick Start
//!
//! ```no_run
//! use domectl_lib::{
//!     ac_safe_client::SafeAcClient,
//!     motor_client::MotorDriver,
//!     motor_protocol::MotorFirmware,
//!     pacer::{MotionPacer, PacerTiming},
//!     transport::{SerialSettings, SerialTransport},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ac_settings = SerialSettings::ac_controller("/dev/ttyUSB1");
//!     let ac = SafeAcClient::connect(SerialTransport::open(&ac_settings)?, *ac_settings.unit);
//!     ac.write_setpoints(18.0, 22.0)?;
//!     println!("Enclosure at {:.1} °C", ac.read_sensor_celsius()?);
//!
//!     let motor_settings = SerialSettings::motor("/dev/ttyUSB0");
//!     let (motor, _baud) = MotorDriver::connect_autobaud(&motor_settings, MotorFirmware::gen1())?;
//!     let mut pacer = MotionPacer::new(&motor, PacerTiming::default());
//!     pacer.paced_move(-2300)?;
//!     pacer.await_completion(pacer.timing().move_budget);
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod frame;
pub mod transport;

pub mod ac_protocol;
pub mod ac_client;
pub mod ac_safe_client;

pub mod motor_protocol;
pub mod motor_client;
pub mod pacer;

#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
#[cfg(feature = "async")]
pub mod async_client;

pub use error::{Error, ProtocolError, Result, TransportError};
