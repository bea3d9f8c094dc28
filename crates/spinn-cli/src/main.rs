// SPDX-License-Identifier: AGPL-3.0-only

//! `spinn`: command-line interface for SpiNNaker machines.
//!
//! ```text
//! USAGE:
//!   spinn info <host> [--bmp] [--board N]        Identify the monitor or BMP
//!   spinn ping <host> [--count N]                Round-trip SCP to the root chip
//!   spinn power <host> on|off [--board N]...     Switch boards via the BMP
//!   spinn boot <host> <image> [--sv FILE]        Send a monitor image
//!   spinn minimise <file> [--target N]           Compress a routing table
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use spinn_driver::{BmpConfig, BmpController, MachineConfig, MachineController, ScpConfig};
use spinn_routing::{format_table, minimise_table, parse_table, MinimiseConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spinn", about = "SpiNNaker machine and routing table CLI", version)]
struct Cli {
    /// Reply timeout per SCP attempt, in milliseconds.
    #[arg(long, global = true, default_value_t = 500)]
    timeout_ms: u64,
    /// Retransmissions before giving up.
    #[arg(long, global = true, default_value_t = 4)]
    retries: u32,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum PowerState {
    On,
    Off,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the software version of a machine's root monitor or a BMP.
    Info {
        /// Hostname or IP address.
        host: String,
        /// Talk to a board management processor.
        #[arg(long)]
        bmp: bool,
        /// Board to query (BMP only).
        #[arg(long, default_value_t = 0)]
        board: u8,
    },
    /// Measure SCP round-trip time to the root chip.
    Ping {
        /// Hostname or IP address.
        host: String,
        /// Number of requests.
        #[arg(long, default_value_t = 4)]
        count: u32,
    },
    /// Switch boards on or off through their BMP.
    Power {
        /// BMP hostname or IP address.
        host: String,
        /// Desired state.
        state: PowerState,
        /// Boards to switch (repeatable).
        #[arg(long = "board", default_values_t = [0u8])]
        boards: Vec<u8>,
        /// Delay before switching, in milliseconds.
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Boot a machine with a monitor image.
    Boot {
        /// Hostname or IP address.
        host: String,
        /// Monitor image.
        image: PathBuf,
        /// 128-byte system-variable block.
        #[arg(long)]
        sv: Option<PathBuf>,
    },
    /// Minimise a routing table read from a file (`key mask routes [sources]`).
    Minimise {
        /// Table file.
        file: PathBuf,
        /// Maximum number of entries.
        #[arg(long)]
        target: Option<usize>,
        /// Allow entries to be replaced by default routing.
        #[arg(long)]
        default_routing: bool,
        /// Write the result here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let scp = ScpConfig::default()
        .with_timeout(Duration::from_millis(cli.timeout_ms))
        .with_retries(cli.retries);

    match cli.command {
        Cmd::Info { host, bmp, board } => cmd_info(&host, bmp, board, scp)?,
        Cmd::Ping { host, count } => cmd_ping(&host, count, scp)?,
        Cmd::Power { host, state, boards, delay_ms } => {
            cmd_power(&host, state, &boards, Duration::from_millis(delay_ms), scp)?;
        }
        Cmd::Boot { host, image, sv } => cmd_boot(&host, &image, sv.as_deref(), scp)?,
        Cmd::Minimise { file, target, default_routing, output } => {
            cmd_minimise(&file, target, default_routing, output.as_deref())?;
        }
    }

    Ok(())
}

fn cmd_info(host: &str, bmp: bool, board: u8, scp: ScpConfig) -> Result<()> {
    if bmp {
        let mut controller = BmpController::connect(host, BmpConfig { scp, ..BmpConfig::default() })?;
        let info = controller.software_version(0, 0, board)?;
        println!("{info}");
        println!("     Buffer {} bytes   Built {}", info.buffer_size, info.build_date);
    } else {
        let mut mc = MachineController::connect(host, MachineConfig::default().with_scp(scp))?;
        let info = mc.software_version(0, 0, 0)?;
        println!("{info}");
        println!(
            "     Buffer {} bytes   Physical CPU {}   Built {}",
            info.buffer_size, info.physical_cpu, info.build_date
        );
    }
    Ok(())
}

fn cmd_ping(host: &str, count: u32, scp: ScpConfig) -> Result<()> {
    let mut mc = MachineController::connect(host, MachineConfig::default().with_scp(scp))?;
    let mut times = Vec::with_capacity(count as usize);

    for i in 0..count {
        let start = Instant::now();
        match mc.software_version(0, 0, 0) {
            Ok(_) => {
                let rtt = start.elapsed();
                println!("seq={i} time={:.3} ms", rtt.as_secs_f64() * 1e3);
                times.push(rtt);
            }
            Err(e) if e.is_timeout() => println!("seq={i} timeout"),
            Err(e) => return Err(e.into()),
        }
    }

    if let (Some(min), Some(max)) = (times.iter().min(), times.iter().max()) {
        let mean = times.iter().sum::<Duration>() / times.len() as u32;
        println!(
            "{}/{count} replies, min/mean/max = {:.3}/{:.3}/{:.3} ms",
            times.len(),
            min.as_secs_f64() * 1e3,
            mean.as_secs_f64() * 1e3,
            max.as_secs_f64() * 1e3
        );
    } else {
        anyhow::bail!("no replies from {host}");
    }
    Ok(())
}

fn cmd_power(
    host: &str,
    state: PowerState,
    boards: &[u8],
    delay: Duration,
    scp: ScpConfig,
) -> Result<()> {
    let mut controller = BmpController::connect(host, BmpConfig { scp, ..BmpConfig::default() })?;
    let on = matches!(state, PowerState::On);
    controller
        .set_power(on, 0, 0, boards, delay)
        .with_context(|| format!("switching boards {boards:?} {}", if on { "on" } else { "off" }))?;
    println!("Boards {boards:?} {}", if on { "on" } else { "off" });
    Ok(())
}

fn cmd_boot(host: &str, image: &Path, sv: Option<&Path>, scp: ScpConfig) -> Result<()> {
    let image = fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let sv = sv
        .map(|p| fs::read(p).with_context(|| format!("reading {}", p.display())))
        .transpose()?;

    let mut mc = MachineController::connect(host, MachineConfig::default().with_scp(scp))?;
    mc.boot(&image, sv.as_deref())?;
    let info = mc.software_version(0, 0, 0).context("machine did not answer after boot")?;
    println!("Booted: {info}");
    Ok(())
}

fn cmd_minimise(
    file: &Path,
    target: Option<usize>,
    default_routing: bool,
    output: Option<&Path>,
) -> Result<()> {
    let text = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let table = parse_table(&text).with_context(|| format!("parsing {}", file.display()))?;

    debug!(entries = table.len(), ?target, default_routing, "Minimising table");

    let mut config = MinimiseConfig::default();
    if default_routing {
        config = config.with_default_routing();
    }
    let minimised = minimise_table(&table, target, &config)?;
    eprintln!("{} entries -> {} entries", table.len(), minimised.len());

    let rendered = format_table(&minimised);
    match output {
        Some(path) => {
            fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))?;
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
