//! CLI entry point for the TVAC bench.
//!
//! ```bash
//! # Log and control the bench described by config/tvac.toml
//! tvac_daq run
//!
//! # Dry run against the simulated bench, 5 s period
//! tvac_daq run --mock --period 5 --threshold U-plane=56:57
//!
//! # Summarise a finished log
//! tvac_daq read log/temp_plotter_20240312_101500.txt
//!
//! # Show the channel table
//! tvac_daq channels
//! ```
//!
//! `run` also reads operator commands on stdin (`set <group> <low|high> <value>`, `status`,
//! `stop`). Ctrl-C stops after the tick in progress.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::runtime::Runtime;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tvac_daq::actuator::ThresholdActuator;
use tvac_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use tvac_daq::console::{run_console, ConsoleLinks};
use tvac_daq::controller::{
    build_poller, log_metadata, run_timestamp, simulated_bench, RunStatus, SharedSeries,
    StopReason, TickHandler,
};
use tvac_daq::data::log_reader::read_log;
use tvac_daq::data::sample_log::{log_file_path, SampleLogger};
use tvac_daq::data::schema::LogSchema;
use tvac_daq::data::series::LiveSeriesStore;
use tvac_daq::instrument::{Connector, TransportKind};
use tvac_daq::tracing_config;

#[derive(Parser)]
#[command(name = "tvac_daq")]
#[command(about = "TVAC bench acquisition, heater control and logging", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll, control heaters and log until stopped
    Run {
        /// Use the simulated bench for every instrument
        #[arg(long)]
        mock: bool,

        /// DAQ970A address (host, host:port or TCPIP::host::INSTR)
        #[arg(long)]
        daq_address: Option<String>,

        /// Power supply address
        #[arg(long)]
        psu_address: Option<String>,

        /// Poll period in seconds
        #[arg(long)]
        period: Option<u64>,

        /// Heater thresholds, GROUP=LOW:HIGH (repeatable)
        #[arg(long = "threshold", value_name = "GROUP=LOW:HIGH")]
        thresholds: Vec<String>,

        /// Do not read operator commands from stdin
        #[arg(long)]
        no_console: bool,

        /// Open the live plot window
        #[cfg(feature = "gui")]
        #[arg(long)]
        plot: bool,
    },

    /// Summarise a log file
    Read {
        /// Log file written by `run`
        log: PathBuf,
    },

    /// Print the channel table and heater groups
    Channels,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading '{}'", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            mock,
            daq_address,
            psu_address,
            period,
            thresholds,
            no_console,
            #[cfg(feature = "gui")]
            plot,
        } => {
            if mock {
                settings.daq.transport = TransportKind::Mock;
                settings.psu.transport = TransportKind::Mock;
            }
            if let Some(address) = daq_address {
                settings.daq.address = address;
            }
            if let Some(address) = psu_address {
                settings.psu.address = address;
            }
            if let Some(period) = period {
                settings.acquisition.period_secs = period;
            }
            for spec in &thresholds {
                apply_threshold_override(&mut settings, spec)?;
            }
            #[cfg(not(feature = "gui"))]
            let plot = false;
            run(settings, !no_console, plot)
        }
        Commands::Read { log } => {
            tracing_config::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
            read(&log)
        }
        Commands::Channels => {
            tracing_config::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
            channels(&settings)
        }
    }
}

/// `GROUP=LOW:HIGH` onto the matching heater group.
fn apply_threshold_override(settings: &mut Settings, spec: &str) -> Result<()> {
    let (group, band) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("threshold '{}' is not GROUP=LOW:HIGH", spec))?;
    let (low, high) = band
        .split_once(':')
        .ok_or_else(|| anyhow!("threshold '{}' is not GROUP=LOW:HIGH", spec))?;
    let heater = settings
        .heaters
        .iter_mut()
        .find(|h| h.name == group)
        .ok_or_else(|| anyhow!("unknown heater group '{}'", group))?;
    heater.low = low.trim().parse().with_context(|| format!("low threshold '{}'", low))?;
    heater.high = high
        .trim()
        .parse()
        .with_context(|| format!("high threshold '{}'", high))?;
    Ok(())
}

fn run(settings: Settings, console: bool, plot: bool) -> Result<()> {
    tracing_config::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
    settings.validate()?;

    let runtime = Runtime::new()?;
    let map = settings.channel_map()?;
    let table = settings.threshold_table()?;
    let groups = settings.heater_groups(&map)?;

    let simulated = settings.daq.transport == TransportKind::Mock
        || settings.psu.transport == TransportKind::Mock;
    let connector = if simulated {
        info!("Using the simulated bench");
        Connector::with_mock(simulated_bench(&settings, &map))
    } else {
        Connector::new()
    };

    let mut poller = build_poller(&settings, map, &connector)?;
    let identities = runtime.block_on(async {
        poller.connect_all().await?;
        Ok::<_, tvac_daq::error::DaqError>(poller.identities().await)
    })?;

    let timestr = run_timestamp();
    let path = log_file_path(
        &settings.storage.output_dir,
        &settings.storage.file_prefix,
        &timestr,
    );
    let metadata = log_metadata(&settings, &timestr, &identities, &table);
    let schema = LogSchema::new(poller.map(), poller.psu_channels());
    let mut logger = SampleLogger::create(&path, schema, &metadata)?;
    logger.write_header()?;

    let series = Arc::new(RwLock::new(LiveSeriesStore::new(
        poller.map(),
        poller.psu_channels(),
        settings.acquisition.history_capacity,
    )?));

    let (threshold_tx, threshold_rx) = watch::channel(table);
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let handler = TickHandler::new(
        poller,
        ThresholdActuator::new(groups),
        logger,
        series,
        threshold_rx,
    );
    let series = handler.series();
    let status = handler.subscribe_status();

    let ctrl_c_stop = Arc::clone(&stop_tx);
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C, stopping after the current tick");
            ctrl_c_stop.send_replace(true);
        }
    });

    if console {
        let links = ConsoleLinks {
            thresholds: threshold_tx,
            stop: Arc::clone(&stop_tx),
            status: status.clone(),
        };
        runtime.spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_console(stdin, tokio::io::stdout(), links).await {
                error!("Console stopped: {}", e);
            }
        });
    }

    let task = runtime.spawn(handler.run(
        settings.period(),
        settings.acquisition.on_connection_loss,
        stop_rx,
    ));

    if plot {
        show_plots(&settings.application.name, series, status)?;
    }

    let (summary, _file) = runtime.block_on(task)??;
    // A pending stdin read would otherwise keep the runtime alive.
    runtime.shutdown_background();
    println!(
        "{} ticks, {} records, {} skipped -> {}",
        summary.ticks,
        summary.records,
        summary.skipped,
        path.display()
    );
    match summary.reason {
        StopReason::Requested => Ok(()),
        StopReason::InstrumentLost(reason) => bail!("run halted: {}", reason),
    }
}

#[cfg(feature = "gui")]
fn show_plots(title: &str, series: SharedSeries, status: watch::Receiver<RunStatus>) -> Result<()> {
    tvac_daq::gui::show(title, series, status)?;
    Ok(())
}

#[cfg(not(feature = "gui"))]
fn show_plots(_title: &str, _series: SharedSeries, _status: watch::Receiver<RunStatus>) -> Result<()> {
    bail!("built without the 'gui' feature")
}

fn read(path: &Path) -> Result<()> {
    let table = read_log(path)?;
    for comment in &table.comments {
        println!("#{}", comment);
    }
    match table.time_span() {
        Some((first, last)) => println!(
            "{} samples over {} s ({} .. {})",
            table.rows.len(),
            last - first,
            first,
            last
        ),
        None => println!("no samples"),
    }

    let mut current = None;
    for stats in table.column_stats() {
        if current != Some(stats.quantity) {
            println!();
            println!("[{}] ({})", stats.quantity.label(), stats.quantity.unit());
            println!(
                "{:<12} {:>14} {:>14} {:>14} {:>14}",
                "column", "min", "mean", "max", "last"
            );
            current = Some(stats.quantity);
        }
        println!(
            "{:<12} {:>14.6} {:>14.6} {:>14.6} {:>14.6}",
            stats.name, stats.min, stats.mean, stats.max, stats.last
        );
    }
    Ok(())
}

fn channels(settings: &Settings) -> Result<()> {
    let map = settings.channel_map()?;
    println!("{:<6} {:<7} {:<10} unit", "id", "plane", "name");
    for (id, unit) in map.scan_order().iter().zip(map.units()) {
        if let Some((plane, name)) = map.resolve(id) {
            println!(
                "{:<6} {:<7} {:<10} {}",
                id.as_str(),
                plane.as_str(),
                name,
                unit
            );
        }
    }
    let sizes = map
        .group_sizes()
        .into_iter()
        .map(|(plane, size)| format!("{}={}", plane, size))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{} channels: {}", map.len(), sizes);

    let groups = settings.heater_groups(&map)?;
    for (group, heater) in groups.iter().zip(&settings.heaters) {
        let references = heater
            .reference
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "heater {}: mean of {} -> outputs {:?}, {} < t < {}",
            group.name(),
            references,
            group.outputs(),
            heater.low,
            heater.high
        );
    }
    Ok(())
}
