//! domectl - enclosure instrument CLI
//!
//! A command-line interface for the RS-485 instruments of an observation
//! enclosure: the AC controller and the cover motor driver.
//!
//! This tool allows users to:
//! - Read the AC enable flags, setpoints and enclosure temperature.
//! - Switch the AC unit on or off and write heater/cooling setpoints.
//! - Monitor the enclosure temperature continuously.
//! - Find the motor driver's baud rate, move, stop and clear alarms.
//! - Run budgeted open/close endurance cycles.
//! - Watch the rain input and close the cover when it rains.
//!
//! The CLI leverages the `domectl_lib` crate for the protocol and device operations.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use domectl_lib::{
    ac_safe_client::SafeAcClient,
    frame::UnitId,
    motor_client::MotorDriver,
    motor_protocol::{FirmwareGeneration, MotorFirmware},
    pacer::{CyclePlan, MotionPacer, MoveOutcome, PacerTiming},
    transport::{SerialSettings, SerialTransport},
};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{panic, thread};

mod commandline;
mod config;

use commandline::{AcCommands, CliDevice, MotorCommands};
use config::Config;

/// Shown instead of a temperature that could not be read.
const NO_READING: &str = "--.- °C";

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

/// A flag that is set on Ctrl-C.
fn interrupted_flag() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let i = interrupted.clone();
    ctrlc::set_handler(move || {
        i.store(true, Ordering::SeqCst);
        trace!("Received Ctrl-C");
    })
    .context("Error setting Ctrl-C handler")?;
    Ok(interrupted)
}

/// Sleeps `duration` in short steps so Ctrl-C is noticed promptly.
fn sleep_unless_interrupted(interrupted: &AtomicBool, duration: Duration) {
    let started = Instant::now();
    while !interrupted.load(Ordering::SeqCst) {
        match duration.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => {
                thread::sleep(remaining.min(Duration::from_millis(100)))
            }
            _ => break,
        }
    }
}

fn format_temperature(reading: Option<f64>) -> String {
    match reading {
        Some(celsius) => format!("{celsius:.1} °C"),
        None => NO_READING.to_string(),
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

macro_rules! print_flags {
    ($client:expr) => {
        let flags = $client
            .read_enable_flags()
            .with_context(|| "Cannot read enable flags")?;
        println!("Enable flags: {flags}");
        println!("  Power: {}", on_off(flags.power_on()));
        println!(
            "  Remote setpoints: {}",
            on_off($client.remote_on_from_flags(flags))
        );
        println!("  Keypad lock: {}", on_off(flags.keypad_locked()));
        println!(
            "  Unit: {}",
            if flags.fahrenheit() { "°F" } else { "°C" }
        );
    };
}

macro_rules! print_setpoints {
    ($client:expr) => {
        let setpoints = $client
            .read_setpoints()
            .with_context(|| "Cannot read setpoints")?;
        println!("Setpoints (°C): {setpoints}");
    };
}

macro_rules! print_sensor {
    ($client:expr) => {
        let celsius = $client
            .read_sensor_celsius()
            .with_context(|| "Cannot read enclosure temperature")?;
        println!("Enclosure temperature: {}", format_temperature(Some(celsius)));
    };
}

fn ac_settings(
    config: &Config,
    device: &Option<String>,
    unit: &Option<UnitId>,
    timeout: Option<Duration>,
) -> SerialSettings {
    let mut settings = config.ac.serial_settings();
    if let Some(device) = device {
        settings.device = device.clone();
    }
    if let Some(unit) = unit {
        settings.unit = *unit;
    }
    if let Some(timeout) = timeout {
        settings.timeout = timeout;
    }
    settings
}

fn handle_ac(config: &Config, settings: &SerialSettings, command: &AcCommands) -> Result<()> {
    info!(
        "Connecting to AC controller on {} (unit {}, {} baud)...",
        settings.device, settings.unit, settings.baud_rate
    );
    let transport = SerialTransport::open(settings)
        .with_context(|| format!("Cannot open AC controller port {}", settings.device))?;
    let client = SafeAcClient::connect(transport, *settings.unit);

    match command {
        AcCommands::Read => {
            info!("Executing: Read AC state");
            print_flags!(client);
            print_setpoints!(client);
            print_sensor!(client);
        }
        AcCommands::Power { state } => {
            info!("Executing: Power {}", on_off(*state));
            let flags = client
                .set_power(*state)
                .with_context(|| format!("Failed to switch the AC unit {}", on_off(*state)))?;
            println!("AC unit switched {} (enable flags {flags}).", on_off(*state));
        }
        AcCommands::Setpoints { heater, cooling } => {
            info!("Executing: Write setpoints heater {heater} °C, cooling {cooling} °C");
            let setpoints = client
                .write_setpoints(*heater, *cooling)
                .with_context(|| {
                    format!("Failed to write setpoints heater {heater} °C, cooling {cooling} °C")
                })?;
            println!("Setpoints written (°C): {setpoints}");
        }
        AcCommands::Monitor { interval } => {
            let interval = interval.unwrap_or(config.ac.poll_interval);
            info!("Starting monitor mode, interval={interval:?}");
            let interrupted = interrupted_flag()?;
            while !interrupted.load(Ordering::SeqCst) {
                let reading = match client.read_sensor_celsius() {
                    Ok(celsius) => Some(celsius),
                    Err(error) => {
                        warn!("Cannot read enclosure temperature: {error}");
                        None
                    }
                };
                println!("Enclosure temperature: {}", format_temperature(reading));
                sleep_unless_interrupted(&interrupted, interval);
            }
        }
    }
    Ok(())
}

struct MotorOptions<'a> {
    device: &'a Option<String>,
    unit: &'a Option<UnitId>,
    baud_rate: Option<u32>,
    firmware: Option<FirmwareGeneration>,
}

fn motor_settings(
    config: &Config,
    options: &MotorOptions,
    timeout: Option<Duration>,
) -> SerialSettings {
    let mut settings = config.motor.serial_settings();
    if let Some(device) = options.device {
        settings.device = device.clone();
    }
    if let Some(unit) = options.unit {
        settings.unit = *unit;
    }
    if let Some(baud_rate) = options.baud_rate {
        settings.baud_rate = baud_rate;
    }
    if let Some(timeout) = timeout {
        settings.timeout = timeout;
    }
    settings
}

fn connect_motor(
    settings: &SerialSettings,
    firmware: MotorFirmware,
    scan: bool,
) -> Result<MotorDriver<SerialTransport>> {
    if scan {
        info!("Scanning {} for the motor driver...", settings.device);
        let (motor, baud_rate) = MotorDriver::connect_autobaud(settings, firmware)
            .with_context(|| format!("No motor driver answers on {}", settings.device))?;
        info!("Motor driver answers at {baud_rate} baud");
        Ok(motor)
    } else {
        info!(
            "Connecting to motor driver on {} at {} baud...",
            settings.device, settings.baud_rate
        );
        let transport = SerialTransport::open(settings)
            .with_context(|| format!("Cannot open motor port {}", settings.device))?;
        Ok(MotorDriver::new(transport, *settings.unit, firmware))
    }
}

fn move_and_wait(pacer: &mut MotionPacer<'_, SerialTransport>, angle: i32) -> Result<()> {
    let ack = pacer
        .paced_move(angle)
        .with_context(|| format!("Move to {angle} failed"))?;
    println!("Move to {angle}: {ack}");
    match pacer.await_completion(pacer.timing().move_budget) {
        MoveOutcome::Completed => println!("Move finished."),
        MoveOutcome::BudgetExpired => println!(
            "Move did not finish within {}, motor stopped.",
            humantime::format_duration(pacer.timing().move_budget)
        ),
    }
    Ok(())
}

/// Asks before a long unattended motor run.
fn confirm_cycle_run(plan: &CyclePlan, timing: &PacerTiming) -> Result<bool> {
    println!(
        "WARNING: The cover will move {} times between {} and {}.",
        plan.cycles, plan.open, plan.close
    );
    println!(
        "Each move may take up to {} before the motor is stopped.",
        humantime::format_duration(timing.move_budget)
    );
    Confirm::new()
        .with_prompt("Make sure nothing obstructs the cover. Do you want to continue?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

fn handle_rain_watch(
    motor: &MotorDriver<SerialTransport>,
    timing: PacerTiming,
    interval: Duration,
    close_angle: i32,
) -> Result<()> {
    let interrupted = interrupted_flag()?;
    let mut pacer = MotionPacer::new(motor, timing);
    let mut closed_for_rain = false;
    info!("Watching the rain input every {interval:?}, closing to {close_angle} on rain");
    while !interrupted.load(Ordering::SeqCst) {
        match motor.check_rain_status() {
            Ok(true) if !closed_for_rain => {
                println!("Rain detected, closing the cover.");
                match move_and_wait(&mut pacer, close_angle) {
                    Ok(()) => closed_for_rain = true,
                    Err(error) => error!("Cannot close the cover: {error:#}"),
                }
            }
            Ok(true) => debug!("Still raining, cover already closed"),
            Ok(false) => {
                if closed_for_rain {
                    println!("Rain stopped.");
                }
                closed_for_rain = false;
            }
            Err(error) => warn!("Cannot read the rain input: {error}"),
        }
        sleep_unless_interrupted(&interrupted, interval);
    }
    Ok(())
}

fn handle_motor(
    config: &Config,
    settings: &SerialSettings,
    firmware: MotorFirmware,
    scan: bool,
    command: &MotorCommands,
) -> Result<()> {
    let motor = connect_motor(settings, firmware, scan)?;
    let timing = config.pacer;

    match command {
        MotorCommands::Scan => {
            println!(
                "Motor driver found on {} at {} baud (unit {}).",
                motor.transport().device(),
                motor.transport().baud_rate(),
                settings.unit
            );
        }
        MotorCommands::Move { angle } => {
            info!("Executing: Move to {angle}");
            move_and_wait(&mut MotionPacer::new(&motor, timing), *angle)?;
        }
        MotorCommands::Open => {
            info!("Executing: Open to {}", config.motor.open_angle);
            move_and_wait(&mut MotionPacer::new(&motor, timing), config.motor.open_angle)?;
        }
        MotorCommands::Close => {
            info!("Executing: Close to {}", config.motor.close_angle);
            move_and_wait(&mut MotionPacer::new(&motor, timing), config.motor.close_angle)?;
        }
        MotorCommands::Stop => {
            info!("Executing: Stop");
            if !motor.stop() {
                anyhow::bail!("The motor driver did not acknowledge the stop command");
            }
            println!("Motor stopped.");
        }
        MotorCommands::ClearAlarm => {
            info!("Executing: Clear alarm");
            if !motor.clear_alarm() {
                anyhow::bail!("The motor driver did not acknowledge the alarm clear");
            }
            println!("Alarm cleared.");
        }
        MotorCommands::Status => {
            info!("Executing: Status");
            println!("Moving: {}", if motor.is_busy() { "yes" } else { "no" });
            let raining = motor
                .check_rain_status()
                .with_context(|| "Cannot read the rain input")?;
            println!("Rain: {}", if raining { "yes" } else { "no" });
        }
        MotorCommands::Cycle {
            open,
            close,
            count,
            yes,
        } => {
            let plan = CyclePlan {
                open: open.unwrap_or(config.motor.open_angle),
                close: close.unwrap_or(config.motor.close_angle),
                cycles: *count,
            };
            if !*yes && !confirm_cycle_run(&plan, &timing)? {
                info!("Cycle run aborted by user.");
                return Ok(());
            }
            let report = MotionPacer::new(&motor, timing)
                .with_cancel_flag(interrupted_flag()?)
                .run_cycles(plan)
                .with_context(|| "Cycle run stopped on a failed move")?;
            println!(
                "{} of {} cycles completed, {} moves stopped at the budget{}.",
                report.completed,
                plan.cycles,
                report.budget_stops,
                if report.cancelled { ", cancelled" } else { "" }
            );
        }
        MotorCommands::RainWatch {
            interval,
            close_angle,
        } => {
            handle_rain_watch(
                &motor,
                timing,
                interval.unwrap_or(config.motor.rain_interval),
                close_angle.unwrap_or(config.motor.close_angle),
            )?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "domectl started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Load the configuration; command line options override it
    let config = Config::load(args.config.as_deref())?;
    trace!("Config: {config:?}");

    // 3. Execute the command
    match &args.device {
        CliDevice::Ac {
            device,
            unit,
            command,
        } => {
            let settings = ac_settings(&config, device, unit, args.timeout);
            handle_ac(&config, &settings, command)
        }
        CliDevice::Motor {
            device,
            unit,
            baud_rate,
            firmware,
            command,
        } => {
            let options = MotorOptions {
                device,
                unit,
                baud_rate: *baud_rate,
                firmware: *firmware,
            };
            let settings = motor_settings(&config, &options, args.timeout);
            let firmware = MotorFirmware::from(options.firmware.unwrap_or(config.motor.firmware));
            let scan = matches!(command, MotorCommands::Scan)
                || (options.baud_rate.is_none() && config.motor.baud_rate.is_none());
            handle_motor(&config, &settings, firmware, scan, command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_formatting() {
        assert_eq!(format_temperature(Some(21.94)), "21.9 °C");
        assert_eq!(format_temperature(Some(-10.0)), "-10.0 °C");
        assert_eq!(format_temperature(None), "--.- °C");
    }

    #[test]
    fn command_line_overrides_config() {
        let config = Config::default();
        let settings = ac_settings(
            &config,
            &Some(String::from("COM10")),
            &Some(UnitId::new(5).unwrap()),
            Some(Duration::from_millis(700)),
        );
        assert_eq!(settings.device, "COM10");
        assert_eq!(*settings.unit, 5);
        assert_eq!(settings.timeout, Duration::from_millis(700));
        assert_eq!(settings.baud_rate, 19200);

        let options = MotorOptions {
            device: &None,
            unit: &None,
            baud_rate: Some(57600),
            firmware: None,
        };
        let settings = motor_settings(&config, &options, None);
        assert_eq!(settings.device, config.motor.device);
        assert_eq!(settings.baud_rate, 57600);
        assert_eq!(settings.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn sleep_returns_on_interrupt() {
        let interrupted = AtomicBool::new(true);
        let started = Instant::now();
        sleep_unless_interrupted(&interrupted, Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_millis(50));

        let interrupted = AtomicBool::new(false);
        let started = Instant::now();
        sleep_unless_interrupted(&interrupted, Duration::from_millis(30));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
