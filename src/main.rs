use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use _core::codec::{format_current, format_potential};
use _core::logging::init_rust_logging;
use _core::output::format_sci;
use _core::sim::SimulatedCell;
use _core::{
    Engine, EngineConfig, Event, RunConfig, RunParameters, SessionState, SystemClock, Transport,
    UsbTransport,
};

#[derive(Parser, Debug)]
#[command(name = "potentiostat", about = "Control a USB potentiostat and record measurements")]
struct Args {
    /// USB vendor ID (hex)
    #[arg(long, global = true, value_parser = parse_hex, default_value = "a0a0")]
    vid: u16,
    /// USB product ID (hex)
    #[arg(long, global = true, value_parser = parse_hex, default_value = "0002")]
    pid: u16,
    /// Use a simulated resistor of this many ohms instead of hardware
    #[arg(long, global = true)]
    simulate: Option<f64>,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show device identity and calibration
    Info,
    /// Print live readings
    Live {
        /// Number of readings
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
    /// Run a measurement described by a JSON document
    Run { config: PathBuf },
    /// Print the potential profile of a sweep document without running it
    Preview { config: PathBuf },
    /// Run the DAC self-calibration
    DacCalibrate {
        /// Also write the result to flash
        #[arg(long)]
        save: bool,
    },
    /// Determine the zero offsets from live readings (cell must be off)
    ZeroOffset {
        /// Also write the offsets to flash
        #[arg(long)]
        save: bool,
    },
}

fn parse_hex(s: &str) -> std::result::Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex ID {s:?}: {e}"))
}

fn main() {
    let args = Args::parse();
    init_rust_logging(args.verbose);
    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Command::Preview { config } = &args.command {
        return preview(config);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start the runtime")?;
    runtime.block_on(session(args))
}

fn open_transport(args: &Args) -> Result<Box<dyn Transport>> {
    match args.simulate {
        Some(ohms) => {
            info!("Using a simulated {ohms} Ω cell");
            Ok(Box::new(SimulatedCell::resistor(ohms)))
        }
        None => {
            let usb = UsbTransport::open(args.vid, args.pid)
                .with_context(|| format!("could not open {:04x}:{:04x}", args.vid, args.pid))?;
            let id = usb.identity();
            println!(
                "Device: {} {} (serial {})",
                id.manufacturer.as_deref().unwrap_or("?"),
                id.product.as_deref().unwrap_or("?"),
                id.serial_number.as_deref().unwrap_or("?")
            );
            Ok(Box::new(usb))
        }
    }
}

async fn session(args: Args) -> Result<()> {
    let (tx, events) = mpsc::channel();
    let mut engine = Engine::new(
        EngineConfig::default(),
        Arc::new(SystemClock::default()),
        Box::new(tx),
    );
    engine
        .connect(open_transport(&args)?)
        .context("connection failed")?;
    // InitializingIdle -> Idle
    engine.tick()?;

    match args.command {
        Command::Info => {
            if let Some(cal) = engine.calibration() {
                println!("DAC offset: {} gain: {}", cal.dac_offset, cal.dac_gain);
                println!(
                    "Offsets: potential {} current {}",
                    cal.potential_offset, cal.current_offset
                );
                println!("Shunt correction: {:?}", cal.shunt_correction);
            }
            engine.tick()?;
            if let (Some(sample), Some(range)) = (engine.last_sample(), engine.range()) {
                println!(
                    "{}  {}",
                    format_potential(sample.potential),
                    format_current(range, sample.current)
                );
            }
        }
        Command::Live { count } => {
            let mut interval = tokio::time::interval(engine_interval());
            for _ in 0..count {
                interval.tick().await;
                tokio::task::block_in_place(|| engine.tick())?;
                if let (Some(sample), Some(range)) = (engine.last_sample(), engine.range()) {
                    println!(
                        "{}  {}",
                        format_potential(sample.potential),
                        format_current(range, sample.current)
                    );
                }
            }
        }
        Command::Run { config } => {
            let params = RunConfig::from_path(&config)
                .and_then(RunConfig::validate)
                .with_context(|| format!("invalid run configuration {}", config.display()))?;
            engine.start_run(params)?;
            acquire(&mut engine, &events).await?;
        }
        Command::DacCalibrate { save } => {
            engine.dac_calibrate()?;
            if save {
                engine.save_calibration()?;
            }
        }
        Command::ZeroOffset { save } => {
            engine.set_cell(false)?;
            let mut interval = tokio::time::interval(engine_interval());
            while engine.live().len() < 50 {
                interval.tick().await;
                tokio::task::block_in_place(|| engine.tick())?;
            }
            engine.zero_offset()?;
            if save {
                engine.save_calibration()?;
            }
        }
        Command::Preview { config } => preview(&config)?,
    }

    engine.disconnect()?;
    Ok(())
}

fn engine_interval() -> std::time::Duration {
    _core::ADC_READ_INTERVAL
}

/// Tick until the run ends; Ctrl-C interrupts it.
async fn acquire(engine: &mut Engine, events: &Receiver<Event>) -> Result<()> {
    let mut interval = tokio::time::interval(engine_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while engine.state().is_running() {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tokio::task::block_in_place(|| engine.tick()) {
                    if engine.state().is_running() {
                        log::warn!("{e}");
                    } else {
                        return Err(e.into());
                    }
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping the run");
                engine.stop()?;
            }
        }
        print_events(events);
    }
    print_events(events);
    if engine.state() != SessionState::StationaryGraph {
        bail!("run ended in unexpected state {}", engine.state());
    }
    Ok(())
}

fn print_events(events: &Receiver<Event>) {
    for event in events.try_iter() {
        match event {
            Event::Point {
                time,
                potential,
                current,
                charge,
                ..
            } => match charge {
                Some(q) => println!(
                    "{}\t{}\t{}\t{}",
                    format_sci(time),
                    format_sci(potential),
                    format_sci(current),
                    format_sci(q)
                ),
                None => println!(
                    "{}\t{}\t{}",
                    format_sci(time),
                    format_sci(potential),
                    format_sci(current)
                ),
            },
            Event::Capacity {
                key,
                charge,
                discharge,
                ..
            } => println!(
                "# capacity {key}: charge {} Ah, discharge {} Ah",
                format_sci(charge),
                format_sci(discharge)
            ),
            Event::RunFinished { charges, .. } => {
                println!("# charges (µAh): {charges:.2?}")
            }
            _ => {}
        }
    }
}

fn preview(config: &Path) -> Result<()> {
    let params = RunConfig::from_path(config)
        .and_then(RunConfig::validate)
        .with_context(|| format!("invalid run configuration {}", config.display()))?;
    let RunParameters::Sweep(sweep) = params else {
        bail!("only sweep documents can be previewed");
    };
    println!("# duration {} s", format_sci(sweep.duration()));
    for (t, v) in _core::sweep::preview(
        sweep.start_potential(),
        sweep.stop_potential(),
        sweep.upper_bound(),
        sweep.lower_bound(),
        sweep.scan_rate(),
        sweep.cycles(),
        100,
    ) {
        println!("{}\t{}", format_sci(t), format_sci(v));
    }
    Ok(())
}
