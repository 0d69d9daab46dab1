//! Register map and value model of the enclosure AC controller.
//!
//! The unit exposes four temperature setpoints (0.1 °C, signed), a 16-bit
//! enable-flags word and one temperature sensor register. Everything in this
//! module is pure: it converts between Rust values and raw register words.
use crate::error::Error;
use std::fmt;

/// Register addresses of one AC controller model.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcRegisterMap {
    pub cooling: u16,
    pub high_alarm: u16,
    pub low_alarm: u16,
    pub heater: u16,
    /// Where the enable flags are read.
    pub flags_read: u16,
    /// Where the enable flags may be written, tried in order. Some firmware
    /// only accepts flag writes at a mirror address.
    pub flags_write_candidates: Vec<u16>,
    pub sensor: u16,
    /// Bit position of the remote (network) setpoints flag, if the model has one.
    pub remote_setpoints_bit: Option<u8>,
}

impl Default for AcRegisterMap {
    fn default() -> Self {
        Self {
            cooling: 0,
            high_alarm: 1,
            low_alarm: 2,
            heater: 3,
            flags_read: 4,
            flags_write_candidates: vec![4, 6],
            sensor: 12,
            remote_setpoints_bit: Some(EnableFlags::REMOTE_SETPOINTS_BIT),
        }
    }
}

impl AcRegisterMap {
    /// First register of the setpoint block and its length.
    pub fn setpoint_block(&self) -> (u16, u16) {
        let addresses = [self.cooling, self.high_alarm, self.low_alarm, self.heater];
        let first = addresses.iter().copied().min().unwrap_or(0);
        let last = addresses.iter().copied().max().unwrap_or(0);
        (first, last - first + 1)
    }
}

/// The enable-flags word of the AC controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnableFlags(u16);

impl EnableFlags {
    /// Power, active-low: a cleared bit means the unit runs.
    pub const POWER_BIT: u8 = 8;
    /// Remote (network) setpoints: must be set before setpoints can be written.
    pub const REMOTE_SETPOINTS_BIT: u8 = 9;
    /// Keypad lock, always set by this crate.
    pub const KEYPAD_LOCK_BIT: u8 = 10;
    /// Temperature unit Fahrenheit, always cleared by this crate.
    pub const FAHRENHEIT_BIT: u8 = 11;

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    const fn bit(self, bit: u8) -> bool {
        (self.0 >> bit) & 1 == 1
    }

    /// Builds the word this crate writes: keypad locked, Celsius, power per
    /// the active-low convention, the remote bit only if the model has one.
    pub fn compose(power_on: bool, remote_setpoints: bool, remote_bit: Option<u8>) -> Self {
        let mut word = 1 << Self::KEYPAD_LOCK_BIT;
        if !power_on {
            word |= 1 << Self::POWER_BIT;
        }
        if let (true, Some(bit)) = (remote_setpoints, remote_bit) {
            word |= 1 << bit;
        }
        Self(word)
    }

    pub fn power_on(self) -> bool {
        power_on_from_flags(self.0)
    }

    pub fn remote_setpoints(self, remote_bit: Option<u8>) -> bool {
        remote_on_from_flags(self.0, remote_bit)
    }

    pub fn keypad_locked(self) -> bool {
        self.bit(Self::KEYPAD_LOCK_BIT)
    }

    pub fn fahrenheit(self) -> bool {
        self.bit(Self::FAHRENHEIT_BIT)
    }
}

impl fmt::Display for EnableFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Active-low power mapping: bit 8 cleared means ON.
pub fn power_on_from_flags(flags: u16) -> bool {
    (flags >> EnableFlags::POWER_BIT) & 1 == 0
}

/// The remote setpoints flag, always `false` for models without one.
pub fn remote_on_from_flags(flags: u16, remote_bit: Option<u8>) -> bool {
    remote_bit.is_some_and(|bit| (flags >> bit) & 1 == 1)
}

/// Decodes a signed 0.1 °C register.
pub fn celsius_from_register(raw: u16) -> f64 {
    f64::from(raw as i16) / 10.0
}

/// Encodes °C as a signed 0.1 °C register, rounding to the nearest tenth.
pub fn register_from_celsius(celsius: f64) -> u16 {
    ((celsius * 10.0).round() as i16) as u16
}

/// Absolute range a setpoint is clamped to before any write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafeRange {
    pub min: f64,
    pub max: f64,
}

impl SafeRange {
    pub fn clamp(&self, value: f64) -> f64 {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }
}

pub const LOW_ALARM_RANGE: SafeRange = SafeRange {
    min: -20.0,
    max: 25.0,
};
pub const HEATER_RANGE: SafeRange = SafeRange {
    min: -5.0,
    max: 35.0,
};
/// Most models reject cooling setpoints much below 20 °C.
pub const COOLING_RANGE: SafeRange = SafeRange {
    min: 20.0,
    max: 60.0,
};
pub const HIGH_ALARM_RANGE: SafeRange = SafeRange {
    min: 30.0,
    max: 80.0,
};

/// Minimum separation between adjacent setpoints, in °C.
pub const SETPOINT_SEPARATION: f64 = 1.0;
/// The low alarm sits this far below the heater setpoint.
pub const LOW_ALARM_OFFSET: f64 = 2.0;
/// The high alarm sits this far above the cooling setpoint.
pub const HIGH_ALARM_OFFSET: f64 = 5.0;

/// The four setpoints of the AC controller in °C.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointQuad {
    pub low: f64,
    pub heater: f64,
    pub cooling: f64,
    pub high: f64,
}

impl SetpointQuad {
    /// Derives the alarm setpoints from the heater and cooling setpoints,
    /// clamps all four to their safe ranges and checks their ordering.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRange`] with the clamped quad if the ordering fails
    /// (any NaN input fails it too).
    pub fn from_heater_cooling(heater_c: f64, cooling_c: f64) -> Result<Self, Error> {
        let quad = Self {
            low: LOW_ALARM_RANGE.clamp(heater_c - LOW_ALARM_OFFSET),
            heater: HEATER_RANGE.clamp(heater_c),
            cooling: COOLING_RANGE.clamp(cooling_c),
            high: HIGH_ALARM_RANGE.clamp(cooling_c + HIGH_ALARM_OFFSET),
        };
        if quad.is_ordered() {
            Ok(quad)
        } else {
            Err(Error::InvalidRange(quad))
        }
    }

    /// `low < heater - 1`, `heater < cooling - 1` and `cooling < high - 1`.
    pub fn is_ordered(&self) -> bool {
        self.low < self.heater - SETPOINT_SEPARATION
            && self.heater < self.cooling - SETPOINT_SEPARATION
            && self.cooling < self.high - SETPOINT_SEPARATION
    }

    /// `(register, value)` pairs in write order: low, heater, cooling, high.
    ///
    /// The device checks only adjacent pairs on every single write, so this
    /// order never exposes a transient violation when moving a valid quad to
    /// another valid quad in the usual direction.
    pub fn register_writes(&self, map: &AcRegisterMap) -> [(u16, u16); 4] {
        [
            (map.low_alarm, register_from_celsius(self.low)),
            (map.heater, register_from_celsius(self.heater)),
            (map.cooling, register_from_celsius(self.cooling)),
            (map.high_alarm, register_from_celsius(self.high)),
        ]
    }

    /// Decodes the setpoint block read from `map.setpoint_block()`.
    pub fn decode_from_holding_registers(map: &AcRegisterMap, words: &[u16]) -> Option<Self> {
        let (first, _) = map.setpoint_block();
        let get = |address: u16| {
            words
                .get(usize::from(address - first))
                .copied()
                .map(celsius_from_register)
        };
        Some(Self {
            low: get(map.low_alarm)?,
            heater: get(map.heater)?,
            cooling: get(map.cooling)?,
            high: get(map.high_alarm)?,
        })
    }
}

impl fmt::Display for SetpointQuad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "low {:.1} °C, heater {:.1} °C, cooling {:.1} °C, high {:.1} °C",
            self.low, self.heater, self.cooling, self.high
        )
    }
}
