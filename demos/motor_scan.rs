// Motor scan: READ-ONLY sweep of the CAN bus for LivelyBot motors
//
// Sends a reply-requested mode read to each id and lists who answers.
// Nothing is written to any register, so no motor will move.
//
// Usage: cargo run --example motor_scan -- [--interface can0] [--start 1] [--end 14]
// Link check: cargo run --example motor_scan -- --test 3
// Save report: cargo run --example motor_scan -- --save scan.json

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use crossterm::execute;
use crossterm::style::{Print, Stylize};

use livelybot_can_runtime::config::{DEFAULT_BITRATE, DEFAULT_INTERFACE};
use livelybot_can_runtime::motor::DeviceId;
use livelybot_can_runtime::motor::bus::open_socketcan;
use livelybot_can_runtime::motor::discovery::{
    self, DEFAULT_SCAN_RANGE, LinkGrade, MotorInfo, ProbeTiming, ScanReport,
};

/// Scan the CAN bus for LivelyBot motors
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = DEFAULT_INTERFACE)]
    interface: String,

    #[arg(long, default_value_t = DEFAULT_BITRATE)]
    bitrate: u32,

    /// First id to probe
    #[arg(long, default_value_t = *DEFAULT_SCAN_RANGE.start())]
    start: u8,

    /// Last id to probe
    #[arg(long, default_value_t = *DEFAULT_SCAN_RANGE.end())]
    end: u8,

    /// Listen window per probe (ms)
    #[arg(long, default_value_t = 50)]
    timeout_ms: u64,

    /// Ping one id ten times and grade the link instead of scanning
    #[arg(long)]
    test: Option<u8>,

    /// Write the scan report as JSON
    #[arg(long)]
    save: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warn".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let timing = ProbeTiming {
        window: Duration::from_millis(args.timeout_ms),
        ..ProbeTiming::default()
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              LivelyBot Motor Scan (READ-ONLY)                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Probes with register reads only - no writes, no movement    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Interface: {} ({} bit/s)", args.interface, args.bitrate);
    println!();

    println!("Step 1: Opening CAN interface...");
    let bus = match open_socketcan(&args.interface, args.bitrate) {
        Ok(bus) => {
            println!("  ✓ Interface opened");
            bus
        }
        Err(e) => {
            println!("  ✗ Failed to open interface: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Bring the link up: sudo ip link set {} up type can bitrate {}", args.interface, args.bitrate);
            println!("  - Check the 120Ω termination and CAN_H/CAN_L wiring");
            println!("  - Verify the motors are powered");
            return Err(e.into());
        }
    };
    println!();

    if let Some(id) = args.test {
        let device = DeviceId::new(id)?;
        println!("Step 2: Testing link to motor {} (10 probes)...", device);
        let quality = discovery::link_quality(bus.as_ref(), device, 10, &timing);
        let verdict = match quality.grade() {
            LinkGrade::Excellent => "✓ Excellent".green(),
            LinkGrade::Fair => "⚠ Fair".yellow(),
            LinkGrade::Poor => "✗ Poor".red(),
        };
        execute!(
            io::stdout(),
            Print(format!(
                "  {}/{} replies ({:.1}%) ",
                quality.successes,
                quality.attempts,
                quality.percent()
            )),
            Print(verdict),
            Print("\n"),
        )?;
        bus.close();
        return Ok(());
    }

    println!("Step 2: Probing ids {}-{}...", args.start, args.end);
    let mut motors = Vec::new();
    for id in args.start..=args.end {
        let Ok(device) = DeviceId::new(id) else {
            continue;
        };
        print!("  ID {:3}: ", id);
        io::stdout().flush()?;

        let motor = match discovery::ping(bus.as_ref(), device, &timing) {
            Ok(motor) => motor,
            Err(e) => {
                println!("✗ ERROR: {}", e);
                motors.push(MotorInfo::offline(device));
                continue;
            }
        };

        if motor.online {
            let detail = match (&motor.name, &motor.hardware_version) {
                (Some(name), Some(version)) => format!(" {} {}", name, version),
                (Some(name), None) => format!(" {}", name),
                _ => String::new(),
            };
            let millis = motor.response_time.map_or(0.0, |t| t.as_secs_f64() * 1000.0);
            execute!(
                io::stdout(),
                Print("✓ RESPONDING".green()),
                Print(format!("{} ({:.1} ms)\n", detail, millis)),
            )?;
        } else {
            println!("✗ no response");
        }
        motors.push(motor);
        std::thread::sleep(timing.gap);
    }
    println!();

    let report = ScanReport::new(&args.interface, args.bitrate, args.start..=args.end, motors);
    if report.found.is_empty() {
        println!("⚠ No motors found");
        println!("  - Check motor power supply");
        println!("  - Check the bitrate matches the motors");
    } else {
        println!("✓ Online motors: {:?} ({} total)", report.found, report.found.len());
    }

    if let Some(path) = &args.save {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        println!("Report saved to {}", path.display());
    }

    bus.close();
    Ok(())
}
