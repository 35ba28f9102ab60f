//! Unified CLI tool for the Galil motion bench.
//!
//! Subcommands:
//! - `info`: Dump controller firmware, serial, positions and status
//! - `ip`: Show or change the controller IP address
//! - `positions`: Read axis positions
//! - `jog`: Jog an axis at a signed speed
//! - `stop`: Stop one axis or all axes
//! - `tune`: Load PID gains and hold position
//! - `configure`: Apply axis presets from the config file
//! - `reset`: Move an axis to 0 and redefine it as the origin
//! - `test`: Run the automated ±distance motion verification
//! - `repl`: Send raw commands

use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::galil::sim::SimulatedController;
use hardware::galil::{Axis, CommandChannel, Controller, TcpChannel};
use motion_bench::config::{BenchConfig, ConfigStorage};
use motion_bench::diagnostics::{controller_info, controller_ip, set_controller_ip};
use motion_bench::events::EventLevel;
use motion_bench::program::MotionProgram;
use motion_bench::sequencer::SequencerConfig;
use motion_bench::session::{SessionOptions, TestSession};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Link = Box<dyn CommandChannel>;

/// Galil motion bench tool
#[derive(Parser, Debug)]
#[command(name = "galil_tool")]
#[command(about = "Control and verify a Galil motion controller")]
#[command(version)]
struct Args {
    /// Controller IP address (defaults to the config file)
    #[arg(long, global = true)]
    ip: Option<String>,

    /// Controller TCP port (defaults to the config file)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Config directory (defaults to ~/.galil_bench)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the built-in simulated controller instead of the network
    #[arg(long, global = true)]
    simulate: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query controller info and IP address
    Info,

    /// Show the controller IP address, or assign a new one
    Ip {
        /// New address; also written to the config file
        #[arg(long)]
        set: Option<Ipv4Addr>,
    },

    /// Read axis positions
    Positions {
        /// Keep reading every interval (milliseconds)
        #[arg(long)]
        watch_ms: Option<u64>,

        /// Number of readings when watching
        #[arg(long, default_value = "20")]
        count: u32,
    },

    /// Jog an axis
    Jog {
        #[arg(short, long, ignore_case = true)]
        axis: Axis,

        /// Speed in counts/s; negative jogs in reverse (defaults to the preset)
        #[arg(short, long, allow_hyphen_values = true)]
        speed: Option<i64>,

        /// Jog in reverse
        #[arg(short, long)]
        reverse: bool,

        /// Stop after this many milliseconds (keeps jogging if omitted)
        #[arg(short, long)]
        duration_ms: Option<u64>,
    },

    /// Stop motion
    Stop {
        /// Axis to stop (stops all if not specified)
        #[arg(short, long, ignore_case = true)]
        axis: Option<Axis>,
    },

    /// Set PID gains, re-engage the servo and hold position
    Tune {
        #[arg(short, long, ignore_case = true)]
        axis: Axis,

        #[arg(long)]
        kp: Option<f64>,

        #[arg(long)]
        ki: Option<f64>,

        #[arg(long)]
        kd: Option<f64>,
    },

    /// Apply axis presets from the config file
    Configure {
        /// Axis to configure (all presets if not specified)
        #[arg(short, long, ignore_case = true)]
        axis: Option<Axis>,

        /// Write the effective config back to the config directory
        #[arg(long)]
        save: bool,
    },

    /// Move an axis to 0 and define that as the origin
    Reset {
        #[arg(short, long, ignore_case = true)]
        axis: Axis,
    },

    /// Run the automated motion verification
    Test {
        /// Axes to test, in order
        #[arg(long, value_delimiter = ',', ignore_case = true, default_values_t = vec![Axis::A, Axis::B, Axis::C])]
        axes: Vec<Axis>,

        /// Total sweep distance in mm (±half around the current position)
        #[arg(long, default_value = "20")]
        distance_mm: f64,

        /// Move speed in counts/s
        #[arg(long, default_value = "10000")]
        speed: i64,

        /// Move failures tolerated per axis
        #[arg(long, default_value = "3")]
        max_errors: u32,

        /// Position tolerance in counts
        #[arg(long, default_value = "10")]
        tolerance: i64,

        /// Split moves into steps of at most this many counts
        #[arg(long)]
        max_step: Option<u32>,

        /// Verification poll interval in milliseconds
        #[arg(long, default_value = "50")]
        poll_ms: u64,

        /// Maximum verification wait in milliseconds
        #[arg(long, default_value = "5000")]
        max_wait_ms: u64,

        /// Skip applying presets before each axis
        #[arg(long)]
        no_presets: bool,
    },

    /// Interactive raw command REPL
    Repl,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let storage = match &args.config {
        Some(path) => ConfigStorage::with_path(path.clone()),
        None => ConfigStorage::new()?,
    };
    let mut config = storage
        .load()
        .with_context(|| format!("Loading {}", storage.config_path().display()))?;
    if let Some(ip) = &args.ip {
        config.ip_address = ip.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    if let Command::Ip { set } = args.command {
        return cmd_ip(&storage, config, set, args.simulate);
    }

    let controller = connect(&config, args.simulate)?;

    match args.command {
        Command::Ip { .. } => unreachable!("handled before connecting"),
        Command::Info => cmd_info(&controller),
        Command::Positions { watch_ms, count } => cmd_positions(&controller, watch_ms, count),
        Command::Jog {
            axis,
            speed,
            reverse,
            duration_ms,
        } => cmd_jog(&controller, &config, axis, speed, reverse, duration_ms),
        Command::Stop { axis } => cmd_stop(&controller, axis),
        Command::Tune { axis, kp, ki, kd } => cmd_tune(&controller, &config, axis, kp, ki, kd),
        Command::Configure { axis, save } => {
            cmd_configure(&controller, &config, axis)?;
            if save {
                let path = storage.save(&config)?;
                println!("Saved config to {}", path.display());
            }
            Ok(())
        }
        Command::Reset { axis } => cmd_reset(&controller, axis),
        Command::Test {
            axes,
            distance_mm,
            speed,
            max_errors,
            tolerance,
            max_step,
            poll_ms,
            max_wait_ms,
            no_presets,
        } => {
            let sequencer = SequencerConfig {
                poll_interval: Duration::from_millis(poll_ms),
                max_wait: Duration::from_millis(max_wait_ms),
                tolerance,
                max_errors,
                max_step,
            };
            cmd_test(
                controller,
                &config,
                axes,
                distance_mm,
                speed,
                sequencer,
                no_presets,
                args.verbose,
            )
        }
        Command::Repl => cmd_repl(&controller),
    }
}

fn connect(config: &BenchConfig, simulate: bool) -> Result<Controller<Link>> {
    if simulate {
        info!("Using simulated controller");
        let sim = SimulatedController::new().with_settle_polls(3);
        return Ok(Controller::new(Box::new(sim)));
    }

    println!(
        "Connecting to Galil controller at {}:{}...",
        config.ip_address, config.port
    );
    let channel = TcpChannel::connect_with_timeout(
        (config.ip_address.as_str(), config.port),
        config.timeout(),
    )
    .with_context(|| format!("Connecting to {}", config.ip_address))?;
    Ok(Controller::new(Box::new(channel)))
}

fn cmd_info(controller: &Controller<Link>) -> Result<()> {
    let (info, ip) = controller.with_operations(|ops| (controller_info(ops), controller_ip(ops)))?;
    if info.is_empty() {
        bail!("Controller answered none of the info queries");
    }
    print!("{info}");
    if let Some(ip) = ip {
        println!("IP Address: {ip}");
    }
    Ok(())
}

fn cmd_ip(
    storage: &ConfigStorage,
    config: BenchConfig,
    set: Option<Ipv4Addr>,
    simulate: bool,
) -> Result<()> {
    let Some(ip) = set else {
        println!("Configured: {}", config.ip_address);
        let controller = connect(&config, simulate)?;
        match controller.with_operations(controller_ip)? {
            Some(reported) => println!("Controller reports: {reported}"),
            None => println!("Controller did not report its IP address"),
        }
        return Ok(());
    };

    let updated = BenchConfig {
        ip_address: ip.to_string(),
        ..config.clone()
    };
    let path = storage.save(&updated)?;
    println!("Saved IP {ip} to {}", path.display());

    // The controller still answers on the old address.
    let controller = match connect(&config, simulate) {
        Ok(controller) => controller,
        Err(e) => {
            warn!("Controller not updated: {e:#}");
            return Ok(());
        }
    };
    match controller.with_operations(|ops| set_controller_ip(ops, ip))? {
        Ok(()) => println!("Controller IP set to {ip}; reconnect on the new address"),
        Err(e) => warn!("Controller rejected the new IP: {e}"),
    }
    Ok(())
}

fn cmd_positions(controller: &Controller<Link>, watch_ms: Option<u64>, count: u32) -> Result<()> {
    let readings = if watch_ms.is_some() { count.max(1) } else { 1 };
    for i in 0..readings {
        let snapshot = controller.refresh_positions()?;
        let line = snapshot
            .positions()
            .iter()
            .map(|(axis, counts)| format!("{axis}={counts:>10}"))
            .collect::<Vec<_>>()
            .join("  ");
        println!("{line}");
        if let Some(ms) = watch_ms {
            if i + 1 < readings {
                thread::sleep(Duration::from_millis(ms));
            }
        }
    }
    Ok(())
}

fn cmd_jog(
    controller: &Controller<Link>,
    config: &BenchConfig,
    axis: Axis,
    speed: Option<i64>,
    reverse: bool,
    duration_ms: Option<u64>,
) -> Result<()> {
    let mut speed = speed.unwrap_or_else(|| config.jog_speed_for(axis));
    if reverse {
        speed = -speed;
    }
    println!("Jogging axis {axis} at {speed} counts/s");
    controller.with_operations(|ops| ops.start_jog(axis, speed))??;

    if let Some(ms) = duration_ms {
        thread::sleep(Duration::from_millis(ms));
        controller.with_operations(|ops| ops.stop(axis))??;
        println!("Axis {axis} stopped");
    }
    Ok(())
}

fn cmd_stop(controller: &Controller<Link>, axis: Option<Axis>) -> Result<()> {
    match axis {
        Some(axis) => {
            controller.with_operations(|ops| ops.stop(axis))??;
            println!("Axis {axis} stopped");
        }
        None => {
            controller.with_operations(|ops| ops.stop_all())??;
            println!("All axes stopped");
        }
    }
    Ok(())
}

fn cmd_tune(
    controller: &Controller<Link>,
    config: &BenchConfig,
    axis: Axis,
    kp: Option<f64>,
    ki: Option<f64>,
    kd: Option<f64>,
) -> Result<()> {
    let preset = config.preset_or_empty(axis);
    let (Some(kp), Some(ki), Some(kd)) = (kp.or(preset.kp), ki.or(preset.ki), kd.or(preset.kd))
    else {
        bail!("Axis {axis} has no preset gains; pass --kp, --ki and --kd");
    };
    controller.with_operations(|ops| ops.tune(axis, kp, ki, kd))??;
    println!("Axis {axis} tuned: KP={kp} KI={ki} KD={kd}");
    Ok(())
}

fn cmd_configure(
    controller: &Controller<Link>,
    config: &BenchConfig,
    axis: Option<Axis>,
) -> Result<()> {
    let axes: Vec<Axis> = match axis {
        Some(axis) => vec![axis],
        None => config.axis_presets.keys().copied().collect(),
    };
    for axis in axes {
        let Some(preset) = config.preset(axis) else {
            bail!("No preset for axis {axis}");
        };
        for (code, value) in preset.parameters() {
            controller
                .with_operations(|ops| ops.set_parameter(axis, code, value))?
                .with_context(|| format!("Axis {axis}: {code}={value}"))?;
            println!("Axis {axis}: {code}={value}");
        }
    }
    Ok(())
}

fn cmd_reset(controller: &Controller<Link>, axis: Axis) -> Result<()> {
    controller.with_operations(|ops| ops.reset_position(axis))??;
    println!("Axis {axis} position reset to 0");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_test(
    controller: Controller<Link>,
    config: &BenchConfig,
    axes: Vec<Axis>,
    distance_mm: f64,
    speed: i64,
    sequencer: SequencerConfig,
    no_presets: bool,
    verbose: bool,
) -> Result<()> {
    let start = controller.refresh_positions()?;
    let mut program = MotionProgram::new();
    for &axis in &axes {
        let preset = config.preset_or_empty(axis);
        let origin = start.get(axis).unwrap_or(0);
        program = program.symmetric_sweep_mm(
            axis,
            origin,
            distance_mm,
            preset.turns_per_mm,
            preset.clicks_per_turn,
            speed,
        );
    }

    let options = SessionOptions {
        sequencer,
        presets: if no_presets {
            Default::default()
        } else {
            config.axis_presets.clone()
        },
    };

    let session = TestSession::new(controller);
    let handle = session.start(program, axes, options)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let token = handle.cancellation_token();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling");
            token.cancel();
        }
    });

    for event in handle.events() {
        if verbose || event.level >= EventLevel::Info {
            println!("{event}");
        }
    }

    let summary = handle.wait()?;
    println!();
    print!("{summary}");
    if !summary.all_completed() {
        bail!("Motion test did not complete on every axis");
    }
    Ok(())
}

fn cmd_repl(controller: &Controller<Link>) -> Result<()> {
    println!("Galil REPL - Enter raw commands, 'quit' to exit");
    println!("Examples: TP, MG _FW, SHA, PA A=1000, BGA");
    println!();

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break; // EOF
        }

        let cmd = input.trim();
        if cmd.is_empty() {
            continue;
        }
        if cmd.eq_ignore_ascii_case("quit") || cmd.eq_ignore_ascii_case("exit") {
            println!("Bye!");
            break;
        }

        match controller.with_operations(|ops| ops.probe_mut().send_raw(cmd))? {
            Ok(reply) => println!("{reply}"),
            Err(e) => println!("Error: {e}"),
        }
    }

    Ok(())
}
