//! Blocking client for the enclosure AC controller.
//!
//! [`AcController`] turns the register model of [`crate::ac_protocol`] into
//! device operations over any [`Transport`]. It remembers which address
//! accepted the enable-flags write, so it is the one stateful piece of the AC
//! side. Share it between a poll loop and a command path through
//! [`crate::ac_safe_client::SafeAcClient`].
//!
//! ## Example
//!
//! ```no_run
//! use domectl_lib::ac_client::AcController;
//! use domectl_lib::transport::{SerialSettings, SerialTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = SerialSettings::ac_controller("/dev/ttyUSB1");
//!     let transport = SerialTransport::open(&settings)?;
//!     let mut ac = AcController::connect(&transport, *settings.unit);
//!
//!     println!("Enclosure temperature: {:.1} °C", ac.read_sensor_celsius()?);
//!     ac.write_setpoints(18.0, 22.0)?;
//!     ac.write_flags(true, None)?;
//!     Ok(())
//! }
//! ```
use crate::ac_protocol::{self as proto, AcRegisterMap, EnableFlags, SetpointQuad};
use crate::error::{Error, ProtocolError, Result};
use crate::frame::Request;
use crate::transport::Transport;
use log::*;

/// Synchronous client for one AC controller unit.
#[derive(Debug)]
pub struct AcController<T> {
    transport: T,
    unit: u8,
    map: AcRegisterMap,
    /// The candidate address that last accepted an enable-flags write.
    flags_write_address: Option<u16>,
}

impl<T: Transport> AcController<T> {
    /// Creates a client with the default register map. No I/O is performed.
    pub fn new(transport: T, unit: u8) -> Self {
        Self::with_register_map(transport, unit, AcRegisterMap::default())
    }

    /// Creates a client for a model with a different register map.
    pub fn with_register_map(transport: T, unit: u8, map: AcRegisterMap) -> Self {
        Self {
            transport,
            unit,
            map,
            flags_write_address: None,
        }
    }

    /// Creates a client on a freshly opened transport and enforces the
    /// connect-time policy. A failing policy step is logged, not returned:
    /// the port is open and the unit may simply be busy.
    pub fn connect(transport: T, unit: u8) -> Self {
        let mut controller = Self::new(transport, unit);
        if let Err(error) = controller.enforce_connect_policy() {
            warn!("AC unit {unit}: connect policy not applied: {error}");
        }
        controller
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn register_map(&self) -> &AcRegisterMap {
        &self.map
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Releases the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// The remembered enable-flags write address, if one has worked.
    pub fn flags_write_address(&self) -> Option<u16> {
        self.flags_write_address
    }

    /// Forgets the remembered write address; the next flags write probes
    /// every candidate again.
    pub fn reset_write_address(&mut self) {
        self.flags_write_address = None;
    }

    fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = Request::read_holding_registers(self.unit, start, count);
        let registers = self.transport.execute(&request)?.into_registers();
        if registers.len() != usize::from(count) {
            return Err(ProtocolError::Malformed(format!(
                "{} registers for a read of {count}",
                registers.len()
            ))
            .into());
        }
        Ok(registers)
    }

    fn read_register(&self, address: u16) -> Result<u16> {
        Ok(self.read_registers(address, 1)?[0])
    }

    fn write_register(&self, address: u16, value: u16) -> Result<()> {
        let request = Request::write_single_register(self.unit, address, value);
        self.transport.execute(&request)?;
        Ok(())
    }

    /// Reads the enable-flags word.
    pub fn read_enable_flags(&self) -> Result<EnableFlags> {
        Ok(EnableFlags::from_raw(self.read_register(self.map.flags_read)?))
    }

    /// Reads the enclosure temperature sensor in °C.
    pub fn read_sensor_celsius(&self) -> Result<f64> {
        Ok(proto::celsius_from_register(
            self.read_register(self.map.sensor)?,
        ))
    }

    /// Reads all four setpoints in one request.
    pub fn read_setpoints(&self) -> Result<SetpointQuad> {
        let (first, count) = self.map.setpoint_block();
        let words = self.read_registers(first, count)?;
        SetpointQuad::decode_from_holding_registers(&self.map, &words)
            .ok_or_else(|| ProtocolError::Malformed("incomplete setpoint block".into()).into())
    }

    /// Power state encoded in `flags` (active-low).
    pub fn power_on_from_flags(flags: EnableFlags) -> bool {
        flags.power_on()
    }

    /// Remote setpoints state encoded in `flags` for this model.
    pub fn remote_on_from_flags(&self, flags: EnableFlags) -> bool {
        flags.remote_setpoints(self.map.remote_setpoints_bit)
    }

    /// Finds the flags write address by echoing `current` to each candidate
    /// in order. Returns the address that accepted the write.
    pub fn detect_flags_write_address(&mut self, current: EnableFlags) -> Option<u16> {
        for &candidate in &self.map.flags_write_candidates {
            match self.write_register(candidate, current.raw()) {
                Ok(()) => {
                    debug!("AC unit {}: enable flags writable at {candidate}", self.unit);
                    self.flags_write_address = Some(candidate);
                    return Some(candidate);
                }
                Err(error) => debug!(
                    "AC unit {}: echo write at {candidate} rejected: {error}",
                    self.unit
                ),
            }
        }
        self.flags_write_address = None;
        None
    }

    /// Re-detects the write address and rewrites the current power and
    /// remote state, which asserts keypad lock and Celsius.
    pub fn enforce_connect_policy(&mut self) -> Result<EnableFlags> {
        self.reset_write_address();
        let current = self.read_enable_flags()?;
        if self.detect_flags_write_address(current).is_none() {
            warn!(
                "AC unit {}: no candidate of {:?} accepted the enable flags",
                self.unit, self.map.flags_write_candidates
            );
        }
        let remote = self.remote_on_from_flags(current);
        self.write_flags(current.power_on(), Some(remote))
    }

    /// Writes the enable flags: keypad locked, Celsius, power as requested.
    ///
    /// With `remote_setpoints` set to `None` the remote setpoints bit keeps its
    /// current value (an unreadable flags word counts as "off").
    ///
    /// # Errors
    ///
    /// [`Error::WriteFailed`] if the remembered address, or every candidate
    /// when none is remembered, rejected the write.
    pub fn write_flags(
        &mut self,
        power_on: bool,
        remote_setpoints: Option<bool>,
    ) -> Result<EnableFlags> {
        let remote = match remote_setpoints {
            Some(remote) => remote,
            None => match self.read_enable_flags() {
                Ok(current) => self.remote_on_from_flags(current),
                Err(error) => {
                    warn!(
                        "AC unit {}: cannot read enable flags, treating remote setpoints as off: {error}",
                        self.unit
                    );
                    false
                }
            },
        };
        let word = EnableFlags::compose(power_on, remote, self.map.remote_setpoints_bit);

        let candidates = match self.flags_write_address {
            Some(address) => vec![address],
            None => self.map.flags_write_candidates.clone(),
        };
        let mut failure = None;
        for &address in &candidates {
            match self.write_register(address, word.raw()) {
                Ok(()) => {
                    debug!("AC unit {}: wrote enable flags {word} at {address}", self.unit);
                    self.flags_write_address = Some(address);
                    return Ok(word);
                }
                Err(error) => {
                    debug!(
                        "AC unit {}: enable flags write at {address} failed: {error}",
                        self.unit
                    );
                    failure = Some(error);
                }
            }
        }
        let source = failure.unwrap_or_else(|| {
            ProtocolError::Malformed("no enable flags write address configured".into()).into()
        });
        Err(Error::WriteFailed {
            candidates,
            source: Box::new(source),
        })
    }

    /// Writes heater and cooling setpoints with derived alarm setpoints.
    ///
    /// The quad is validated before any I/O. If remote setpoints are off they
    /// are switched on for the four writes and switched back off afterwards,
    /// whether the writes succeeded or not.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidRange`] before touching the wire.
    /// * The first failing read or write. A failure to restore the remote
    ///   setpoints bit is logged and never replaces it.
    pub fn write_setpoints(&mut self, heater_c: f64, cooling_c: f64) -> Result<SetpointQuad> {
        let quad = SetpointQuad::from_heater_cooling(heater_c, cooling_c)?;

        let initial = self.read_enable_flags()?;
        let had_power = initial.power_on();
        let force_remote =
            self.map.remote_setpoints_bit.is_some() && !self.remote_on_from_flags(initial);

        let result = self.apply_setpoints(&quad, force_remote, had_power);

        if force_remote {
            if let Err(error) = self.write_flags(had_power, Some(false)) {
                warn!(
                    "AC unit {}: cannot restore remote setpoints bit: {error}",
                    self.unit
                );
            }
        }
        result.map(|()| quad)
    }

    fn apply_setpoints(
        &mut self,
        quad: &SetpointQuad,
        force_remote: bool,
        power_on: bool,
    ) -> Result<()> {
        if force_remote {
            self.write_flags(power_on, Some(true))?;
        }
        for (address, value) in quad.register_writes(&self.map) {
            self.write_register(address, value)?;
        }
        info!("AC unit {}: setpoints written: {quad}", self.unit);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::with_crc;
    use crate::transport::mock::MockTransport;
    use assert_matches::assert_matches;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    const READ: u8 = 0x03;
    const WRITE: u8 = 0x06;

    /// A register bank that answers like the AC unit. Writes at addresses in
    /// `rejected` get an illegal data address exception; flag writes at the
    /// mirror address show up at the read address.
    pub(crate) fn fake_ac(
        flags: u16,
        rejected: &[u16],
    ) -> (MockTransport, Arc<Mutex<HashMap<u16, u16>>>) {
        let registers = Arc::new(Mutex::new(HashMap::from([
            (0, 220),
            (1, 270),
            (2, 160),
            (3, 180),
            (4, flags),
            (12, 0xFF9C),
        ])));
        let rejected: HashSet<u16> = rejected.iter().copied().collect();
        let bank = registers.clone();
        let transport = MockTransport::new(move |request| {
            let address = u16::from_be_bytes([request[2], request[3]]);
            let value = u16::from_be_bytes([request[4], request[5]]);
            let mut bank = bank.lock().unwrap();
            match request[1] {
                READ => {
                    let mut body = vec![request[0], READ, (value * 2) as u8];
                    for offset in 0..value {
                        let word = bank.get(&(address + offset)).copied().unwrap_or(0);
                        body.extend_from_slice(&word.to_be_bytes());
                    }
                    with_crc(&body)
                }
                WRITE if rejected.contains(&address) => with_crc(&[request[0], 0x86, 0x02]),
                WRITE => {
                    let target = if address == 6 { 4 } else { address };
                    bank.insert(target, value);
                    request.to_vec()
                }
                _ => Vec::new(),
            }
        });
        (transport, registers)
    }

    fn writes(transport: &MockTransport) -> Vec<(u16, u16)> {
        transport
            .calls()
            .into_iter()
            .filter(|(function, ..)| *function == WRITE)
            .map(|(_, address, value)| (address, value))
            .collect()
    }

    #[test]
    fn read_sensor_and_flags() {
        let (transport, _) = fake_ac(0x0500, &[]);
        let ac = AcController::new(&transport, 1);
        assert_eq!(ac.read_sensor_celsius().unwrap(), -10.0);
        let flags = ac.read_enable_flags().unwrap();
        assert_eq!(flags.raw(), 0x0500);
        assert!(!AcController::<&MockTransport>::power_on_from_flags(flags));
        let quad = ac.read_setpoints().unwrap();
        assert_eq!(quad.heater, 18.0);
        assert_eq!(quad.high, 27.0);
    }

    #[test]
    fn write_flags_maps_power_active_low() {
        let (transport, registers) = fake_ac(0x0000, &[]);
        let mut ac = AcController::new(&transport, 1);

        let on = ac.write_flags(true, Some(false)).unwrap();
        assert_eq!(on.raw(), 0x0400);
        assert_eq!(registers.lock().unwrap()[&4], 0x0400);

        let off = ac.write_flags(false, Some(false)).unwrap();
        assert_eq!(off.raw(), 0x0500);
        assert!(off.keypad_locked());
        assert!(!off.fahrenheit());
    }

    #[test]
    fn write_flags_preserves_remote_bit() {
        // Remote on, Fahrenheit on, keypad unlocked.
        let (transport, _) = fake_ac(0x0A00, &[]);
        let mut ac = AcController::new(&transport, 1);
        let word = ac.write_flags(false, None).unwrap();
        assert_eq!(word.raw(), 0x0700);
    }

    #[test]
    fn write_flags_unreadable_flags_count_as_remote_off() {
        let transport = MockTransport::new(|request| match request[1] {
            WRITE => request.to_vec(),
            _ => Vec::new(),
        });
        let mut ac = AcController::new(&transport, 1);
        assert_eq!(ac.write_flags(true, None).unwrap().raw(), 0x0400);
    }

    #[test]
    fn write_address_is_sticky() {
        let (transport, _) = fake_ac(0x0400, &[4]);
        let mut ac = AcController::new(&transport, 1);

        ac.write_flags(true, Some(false)).unwrap();
        assert_eq!(ac.flags_write_address(), Some(6));
        assert_eq!(writes(&transport), vec![(4, 0x0400), (6, 0x0400)]);

        ac.write_flags(false, Some(false)).unwrap();
        ac.write_flags(true, Some(true)).unwrap();
        assert_eq!(
            writes(&transport),
            vec![(4, 0x0400), (6, 0x0400), (6, 0x0500), (6, 0x0600)]
        );
    }

    #[test]
    fn write_flags_fails_when_every_candidate_fails() {
        let (transport, _) = fake_ac(0x0400, &[4, 6]);
        let mut ac = AcController::new(&transport, 1);
        assert_matches!(
            ac.write_flags(true, Some(false)),
            Err(Error::WriteFailed { candidates, .. }) if candidates == vec![4, 6]
        );
        assert_eq!(ac.flags_write_address(), None);
    }

    #[test]
    fn sticky_address_does_not_fall_back() {
        let transport = MockTransport::new(|request| with_crc(&[request[0], 0x86, 0x04]));
        let mut ac = AcController::new(&transport, 1);
        ac.flags_write_address = Some(4);
        assert_matches!(
            ac.write_flags(true, Some(false)),
            Err(Error::WriteFailed { candidates, .. }) if candidates == vec![4]
        );
        assert_eq!(writes(&transport), vec![(4, 0x0400)]);
    }

    #[test]
    fn connect_detects_address_and_enforces_policy() {
        // Power off, remote on, keypad unlocked, Fahrenheit.
        let (transport, registers) = fake_ac(0x0B00, &[4]);
        let ac = AcController::connect(&transport, 1);
        assert_eq!(ac.flags_write_address(), Some(6));
        // Echo of the unchanged word, then the policy word.
        assert_eq!(
            writes(&transport),
            vec![(4, 0x0B00), (6, 0x0B00), (6, 0x0700)]
        );
        assert_eq!(registers.lock().unwrap()[&4], 0x0700);
    }

    #[test]
    fn reconnect_resets_detection() {
        let (transport, _) = fake_ac(0x0400, &[]);
        let mut ac = AcController::new(&transport, 1);
        ac.flags_write_address = Some(6);
        ac.enforce_connect_policy().unwrap();
        assert_eq!(ac.flags_write_address(), Some(4));
    }

    #[test]
    fn connect_survives_silent_unit() {
        let transport = MockTransport::silent();
        let ac = AcController::connect(&transport, 1);
        assert_eq!(ac.flags_write_address(), None);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn write_setpoints_order_and_remote_restore() {
        let (transport, registers) = fake_ac(0x0400, &[]);
        let mut ac = AcController::new(&transport, 1);
        let quad = ac.write_setpoints(18.0, 22.0).unwrap();
        assert_eq!(quad.low, 16.0);
        // Cooling + 5 is below the high alarm floor of 30 °C.
        assert_eq!(quad.high, 30.0);
        assert_eq!(
            writes(&transport),
            vec![
                (4, 0x0600),
                (2, 160),
                (3, 180),
                (0, 220),
                (1, 300),
                (4, 0x0400)
            ]
        );
        assert_eq!(registers.lock().unwrap()[&4], 0x0400);
    }

    #[test]
    fn write_setpoints_keeps_remote_bit_when_already_on() {
        let (transport, _) = fake_ac(0x0600, &[]);
        let mut ac = AcController::new(&transport, 1);
        ac.write_setpoints(20.0, 26.0).unwrap();
        assert_eq!(
            writes(&transport),
            vec![(2, 180), (3, 200), (0, 260), (1, 310)]
        );
    }

    #[test]
    fn write_setpoints_rejects_without_io() {
        let (transport, _) = fake_ac(0x0400, &[]);
        let mut ac = AcController::new(&transport, 1);
        for (heater, cooling) in [(21.0, 22.0), (40.0, 20.0), (35.0, 35.5), (f64::NAN, 30.0)] {
            assert_matches!(
                ac.write_setpoints(heater, cooling),
                Err(Error::InvalidRange(..))
            );
        }
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn write_setpoints_restores_remote_bit_after_failure() {
        let (transport, registers) = fake_ac(0x0400, &[3]);
        let mut ac = AcController::new(&transport, 1);
        assert_matches!(
            ac.write_setpoints(18.0, 22.0),
            Err(Error::Protocol(ProtocolError::Exception { code: 0x02, .. }))
        );
        assert_eq!(
            writes(&transport),
            vec![(4, 0x0600), (2, 160), (3, 180), (4, 0x0400)]
        );
        assert_eq!(registers.lock().unwrap()[&4], 0x0400);
    }

    #[test]
    fn write_setpoints_swallows_restore_failure() {
        let mut flag_writes = 0;
        let transport = MockTransport::new(move |request| match request[1] {
            // Remote setpoints off, power on.
            READ => with_crc(&[request[0], READ, 0x02, 0x04, 0x00]),
            WRITE if request[3] == 4 => {
                flag_writes += 1;
                if flag_writes > 1 {
                    // The restoring write is lost.
                    Vec::new()
                } else {
                    request.to_vec()
                }
            }
            WRITE => request.to_vec(),
            _ => Vec::new(),
        });
        let mut ac = AcController::new(&transport, 1);
        assert!(ac.write_setpoints(18.0, 22.0).is_ok());
        assert_eq!(writes(&transport).last(), Some(&(4, 0x0400)));
    }
}
