use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use domectl_lib::frame::UnitId;
use domectl_lib::motor_protocol::FirmwareGeneration;
use std::path::PathBuf;
use std::time::Duration;

fn parse_unit(s: &str) -> Result<UnitId, String> {
    let unit = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit id format: {e}"))?;
    UnitId::try_from(unit).map_err(|e| e.to_string())
}

fn parse_firmware(s: &str) -> Result<FirmwareGeneration, String> {
    match s.to_ascii_lowercase().as_str() {
        "gen1" | "1" => Ok(FirmwareGeneration::Gen1),
        "gen2" | "2" => Ok(FirmwareGeneration::Gen2),
        _ => Err(format!("Unknown firmware generation '{s}', expected gen1 or gen2")),
    }
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(format!("Expected 'on' or 'off', got '{s}'")),
    }
}

fn parse_degree_celsius(s: &str) -> Result<f64, String> {
    let value = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid temperature value format: {e}"))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("Temperature must be a finite number, got '{s}'"))
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliDevice {
    /// Talk to the enclosure AC controller (Modbus RTU, 8E1).
    Ac {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB1" (Linux), "COM10" (Windows).
        /// Overrides the `ac.device` entry of the config file.
        #[arg(short, long, verbatim_doc_comment)]
        device: Option<String>,

        /// Modbus unit id of the controller (1 to 247), decimal or hexadecimal.
        #[arg(short, long, value_parser = parse_unit)]
        unit: Option<UnitId>,

        #[command(subcommand)]
        command: AcCommands,
    },
    /// Talk to the cover motor driver (Modbus RTU, 8N1).
    Motor {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB0" (Linux), "COM7" (Windows).
        /// Overrides the `motor.device` entry of the config file.
        #[arg(short, long, verbatim_doc_comment)]
        device: Option<String>,

        /// Modbus unit id of the driver (1 to 247), decimal or hexadecimal.
        #[arg(short, long, value_parser = parse_unit)]
        unit: Option<UnitId>,

        /// Baud rate of the driver.
        /// Without this option (and without `motor.baud_rate` in the config
        /// file) 9600, 19200, 38400, 57600 and 115200 are tried in turn.
        #[arg(short, long, verbatim_doc_comment)]
        baud_rate: Option<u32>,

        /// Firmware generation of the driver: gen1 (36 byte move command) or
        /// gen2 (32 byte move command, angle in tenths).
        #[arg(long, value_parser = parse_firmware, verbatim_doc_comment)]
        firmware: Option<FirmwareGeneration>,

        #[command(subcommand)]
        command: MotorCommands,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum AcCommands {
    /// Read and display the enable flags, the setpoints and the enclosure temperature.
    Read,

    /// Switch the AC unit on or off.
    /// Remote setpoints keep their current state; keypad lock and Celsius are asserted.
    #[clap(verbatim_doc_comment)]
    Power {
        /// "on" or "off".
        #[arg(value_parser = parse_on_off, action = clap::ArgAction::Set)]
        state: bool,
    },

    /// Write heater and cooling setpoints in degrees Celsius (°C).
    /// The low alarm is set 2 °C below the heater setpoint and the high alarm
    /// 5 °C above the cooling setpoint. Values are clamped to the safe ranges
    /// and rejected unless low < heater - 1 < cooling - 1 < high - 1.
    #[clap(verbatim_doc_comment)]
    Setpoints {
        #[arg(value_parser = parse_degree_celsius, allow_negative_numbers = true)]
        heater: f64,
        #[arg(value_parser = parse_degree_celsius, allow_negative_numbers = true)]
        cooling: f64,
    },

    /// Continuously read the enclosure temperature and print it until Ctrl-C.
    Monitor {
        /// Interval between two readings (e.g. "5s", "1m").
        /// Defaults to `ac.poll_interval` of the config file.
        #[arg(short, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
        interval: Option<Duration>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum MotorCommands {
    /// Find the baud rate at which the driver answers.
    Scan,

    /// Move the cover to an angle and wait for the move to finish (bounded by the move budget).
    Move {
        #[arg(allow_negative_numbers = true)]
        angle: i32,
    },

    /// Move the cover to the configured open angle.
    Open,

    /// Move the cover to the configured close angle.
    Close,

    /// Stop the motor.
    Stop,

    /// Clear a latched driver alarm.
    ClearAlarm,

    /// Show whether the motor is moving and whether the rain input is active.
    Status,

    /// Run repeated open/close cycles, e.g. for endurance testing.
    /// Each move is paced, retried once after an alarm clear and stopped when it
    /// exceeds the move budget. Ctrl-C ends the run before the next move.
    #[clap(verbatim_doc_comment)]
    Cycle {
        /// Open angle; defaults to `motor.open_angle` of the config file.
        #[arg(long, allow_negative_numbers = true)]
        open: Option<i32>,

        /// Close angle; defaults to `motor.close_angle` of the config file.
        #[arg(long, allow_negative_numbers = true)]
        close: Option<i32>,

        /// Number of open/close cycles.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Poll the rain input and close the cover when it rains, until Ctrl-C.
    RainWatch {
        /// Interval between two rain checks (e.g. "10s").
        /// Defaults to `motor.rain_interval` of the config file.
        #[arg(short, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
        interval: Option<Duration>,

        /// Angle to move to when it rains; defaults to `motor.close_angle`.
        #[arg(long, allow_negative_numbers = true)]
        close_angle: Option<i32>,
    },
}

const fn about_text() -> &'static str {
    "domectl - Control the enclosure AC unit and cover motor over RS-485."
}

#[derive(Parser, Debug)]
#[command(name="domectl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML configuration file with `ac`, `motor` and `pacer` sections.
    /// Defaults to "domectl.yml" in the working directory, if present.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Reply deadline for device requests, overriding the config file.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub device: CliDevice,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ac_setpoints() {
        let args = CliArgs::try_parse_from([
            "domectl", "ac", "-u", "0x02", "setpoints", "-5", "20.5",
        ])
        .unwrap();
        assert_eq!(
            args.device,
            CliDevice::Ac {
                device: None,
                unit: Some(UnitId::new(2).unwrap()),
                command: AcCommands::Setpoints {
                    heater: -5.0,
                    cooling: 20.5
                },
            }
        );
    }

    #[test]
    fn parse_motor_cycle() {
        let args = CliArgs::try_parse_from([
            "domectl", "--timeout", "1s", "motor", "--firmware", "gen2", "cycle", "--open", "-2250",
            "--close", "-30", "-n", "4000",
        ])
        .unwrap();
        assert_eq!(args.timeout, Some(Duration::from_secs(1)));
        assert_matches::assert_matches!(
            args.device,
            CliDevice::Motor {
                firmware: Some(FirmwareGeneration::Gen2),
                command: MotorCommands::Cycle {
                    open: Some(-2250),
                    close: Some(-30),
                    count: 4000,
                    yes: false
                },
                ..
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(CliArgs::try_parse_from(["domectl", "ac", "-u", "0", "read"]).is_err());
        assert!(CliArgs::try_parse_from(["domectl", "ac", "power", "maybe"]).is_err());
        assert!(CliArgs::try_parse_from(["domectl", "ac", "setpoints", "NaN", "20"]).is_err());
        assert!(
            CliArgs::try_parse_from(["domectl", "motor", "--firmware", "gen3", "stop"]).is_err()
        );
    }

    #[test]
    fn parse_power() {
        let args = CliArgs::try_parse_from(["domectl", "ac", "power", "off"]).unwrap();
        assert_matches::assert_matches!(
            args.device,
            CliDevice::Ac {
                command: AcCommands::Power { state: false },
                ..
            }
        );
    }
}
