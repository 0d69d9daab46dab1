//! Thread-safe handle to an [`AcController`].
//!
//! The GUI-style deployment polls the sensor from one thread while commands
//! arrive on another. [`SafeAcClient`] serializes whole operations, so a
//! setpoint write with its remote-bit toggling is never interleaved with a
//! poll.
//!
//! ## Example
//!
//! ```no_run
//! use domectl_lib::ac_safe_client::SafeAcClient;
//! use domectl_lib::transport::{SerialSettings, SerialTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = SerialSettings::ac_controller("/dev/ttyUSB1");
//!     let client = SafeAcClient::connect(SerialTransport::open(&settings)?, *settings.unit);
//!
//!     let poller = client.clone();
//!     std::thread::spawn(move || {
//!         if let Ok(celsius) = poller.read_sensor_celsius() {
//!             println!("{celsius:.1} °C");
//!         }
//!     });
//!
//!     client.set_power(true)?;
//!     Ok(())
//! }
//! ```

use crate::ac_client::AcController;
use crate::ac_protocol::{AcRegisterMap, EnableFlags, SetpointQuad};
use crate::error::Result;
use crate::transport::Transport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cloneable, shareable AC controller client.
#[derive(Debug)]
pub struct SafeAcClient<T> {
    inner: Arc<Mutex<AcController<T>>>,
}

impl<T> Clone for SafeAcClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> SafeAcClient<T> {
    /// Wraps a controller that is already set up.
    pub fn new(controller: AcController<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(controller)),
        }
    }

    /// Creates a client on a freshly opened transport and enforces the
    /// connect-time policy, see [`AcController::connect`].
    pub fn connect(transport: T, unit: u8) -> Self {
        Self::new(AcController::connect(transport, unit))
    }

    pub fn with_register_map(transport: T, unit: u8, map: AcRegisterMap) -> Self {
        Self::new(AcController::with_register_map(transport, unit, map))
    }

    pub fn from_shared(inner: Arc<Mutex<AcController<T>>>) -> Self {
        Self { inner }
    }

    pub fn clone_shared(&self) -> Arc<Mutex<AcController<T>>> {
        self.inner.clone()
    }

    // A panic inside one operation leaves the controller consistent: the
    // only state is the remembered write address.
    fn lock(&self) -> MutexGuard<'_, AcController<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read_enable_flags(&self) -> Result<EnableFlags> {
        self.lock().read_enable_flags()
    }

    /// Reads the enclosure temperature sensor in °C.
    pub fn read_sensor_celsius(&self) -> Result<f64> {
        self.lock().read_sensor_celsius()
    }

    pub fn read_setpoints(&self) -> Result<SetpointQuad> {
        self.lock().read_setpoints()
    }

    /// Remote setpoints state encoded in `flags` for the connected model.
    pub fn remote_on_from_flags(&self, flags: EnableFlags) -> bool {
        self.lock().remote_on_from_flags(flags)
    }

    /// See [`AcController::write_flags`].
    pub fn write_flags(
        &self,
        power_on: bool,
        remote_setpoints: Option<bool>,
    ) -> Result<EnableFlags> {
        self.lock().write_flags(power_on, remote_setpoints)
    }

    /// Switches the unit on or off, leaving remote setpoints as they are.
    pub fn set_power(&self, on: bool) -> Result<EnableFlags> {
        self.write_flags(on, None)
    }

    /// See [`AcController::write_setpoints`].
    pub fn write_setpoints(&self, heater_c: f64, cooling_c: f64) -> Result<SetpointQuad> {
        self.lock().write_setpoints(heater_c, cooling_c)
    }

    pub fn enforce_connect_policy(&self) -> Result<EnableFlags> {
        self.lock().enforce_connect_policy()
    }

    pub fn flags_write_address(&self) -> Option<u16> {
        self.lock().flags_write_address()
    }

    pub fn reset_write_address(&self) {
        self.lock().reset_write_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ac_client::tests::fake_ac;
    use std::thread;

    #[test]
    fn clones_share_the_write_address() {
        let (transport, _) = fake_ac(0x0400, &[4]);
        let client = SafeAcClient::new(AcController::new(Arc::new(transport), 1));
        let other = client.clone();

        client.set_power(false).unwrap();
        assert_eq!(other.flags_write_address(), Some(6));
        other.reset_write_address();
        assert_eq!(client.flags_write_address(), None);
    }

    #[test]
    fn concurrent_operations_do_not_interleave() {
        let (transport, registers) = fake_ac(0x0400, &[]);
        let transport = Arc::new(transport);
        let client = SafeAcClient::new(AcController::new(transport.clone(), 1));

        let writer = {
            let client = client.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    client.write_setpoints(18.0, 22.0).unwrap();
                }
            })
        };
        for _ in 0..20 {
            client.read_sensor_celsius().unwrap();
        }
        writer.join().unwrap();

        // Each setpoint write is the same six-write sequence with no reads
        // from the poller in between.
        let calls = transport.calls();
        for window in calls.windows(2) {
            if window[0] == (0x06, 4, 0x0600) {
                assert_eq!(window[1], (0x06, 2, 160));
            }
        }
        assert_eq!(registers.lock().unwrap()[&4], 0x0400);
    }
}
