// src/main.rs - cnc-host: stream and simulate G-code for GRBL controllers
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use krusty_cnc::communication::{Ack, Link, MachineCommand};
use krusty_cnc::config::{self, Config};
use krusty_cnc::gcode::{self, BoundingBox, Segment};
use krusty_cnc::job::{JobEvent, JobStreamer, StreamerOptions};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const SETTINGS_DUMP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "cnc-host", version, about = "Drive a GRBL CNC controller over a serial link")]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Serial port, overrides `machine.port`
    #[arg(short, long)]
    port: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Interpret a program and report its path without a machine
    Simulate {
        file: PathBuf,
        /// Print segments as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stream a program to the controller
    Run { file: PathBuf },
    /// Dump the controller's `$` settings
    Settings,
    /// Write one `$` setting and print the value the controller reports back
    Set { id: u16, value: String },
}

#[derive(Serialize)]
struct SimulationReport<'a> {
    total_length: f64,
    bounding_box: Option<BoundingBox>,
    segments: &'a [Segment],
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path);
            config::load_config(path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path, e);
                Box::new(e) as BoxError
            })?
        }
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.machine.port = port;
    }

    match cli.command {
        Command::Ports => {
            for port in Link::native().available_ports() {
                println!("{port}");
            }
            Ok(())
        }
        Command::Simulate { file, json } => simulate(&config, &file, json).await,
        Command::Run { file } => run(&config, &file).await,
        Command::Settings => dump_settings(&config).await,
        Command::Set { id, value } => set_setting(&config, id, &value).await,
    }
}

async fn simulate(config: &Config, file: &Path, json: bool) -> Result<(), BoxError> {
    let program = tokio::fs::read_to_string(file).await?;
    let path = gcode::interpret_with(&program, &config.interpreter);
    let bounding_box = gcode::bounding_box(&program);

    if json {
        let report = SimulationReport {
            total_length: path.total_length,
            bounding_box,
            segments: &path.segments,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("segments:     {}", path.segments.len());
    println!("path length:  {:.3} mm", path.total_length);
    match bounding_box {
        Some(b) => println!(
            "bounding box: X {:.3}..{:.3}  Y {:.3}..{:.3}  ({:.3} x {:.3} mm)",
            b.min_x, b.max_x, b.min_y, b.max_y, b.width(), b.height()
        ),
        None => println!("bounding box: none (no motion)"),
    }
    Ok(())
}

async fn connect(config: &Config) -> Result<Link, BoxError> {
    if config.machine.port.is_empty() {
        return Err("no serial port configured; pass --port or set machine.port".into());
    }
    let link = Link::native();
    link.open(&config.machine.port, config.machine.baud).await?;
    Ok(link)
}

async fn run(config: &Config, file: &Path) -> Result<(), BoxError> {
    let program = tokio::fs::read_to_string(file).await?;
    let link = connect(config).await?;
    let streamer = JobStreamer::new(
        link.clone(),
        StreamerOptions { ack_timeout: config.streamer.ack_timeout() },
    );
    streamer.start_status_polling(config.streamer.poll_interval()).await?;

    let mut events = streamer.subscribe();
    let id = streamer.start(&program).await?;
    tracing::info!("Streaming {} as job {}", file.display(), id);

    let outcome: Result<(), BoxError> = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(JobEvent::Progress(p)) => {
                    let status = link.status();
                    tracing::info!(
                        "{}/{} ({:.1}%) {} X{:.3} Y{:.3} Z{:.3}",
                        p.cursor, p.total, p.fraction() * 100.0, status.state,
                        status.position[0], status.position[1], status.position[2]
                    );
                }
                Ok(JobEvent::LineError { line, code }) => {
                    tracing::warn!("Line {} rejected with error:{}", line + 1, code);
                }
                Ok(JobEvent::Completed { total }) => {
                    tracing::info!("Job finished, {} lines sent", total);
                    break Ok(());
                }
                Ok(JobEvent::Failed(reason)) => {
                    let _ = streamer.stop().await;
                    break Err(reason.into());
                }
                Ok(JobEvent::Aborted) => break Err("link closed during job".into()),
                Ok(_) => {}
                Err(e) => break Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, stopping job");
                streamer.stop().await?;
                break Ok(());
            }
        }
    };

    link.close().await;
    outcome
}

async fn dump_settings(config: &Config) -> Result<(), BoxError> {
    let link = connect(config).await?;
    let pending = link.write_acked(&MachineCommand::DumpSettings.to_line()).await?;

    // The dump ends with the acknowledgment of `$$`.
    match tokio::time::timeout(SETTINGS_DUMP_TIMEOUT, pending.received()).await {
        Ok(Ok(Ack::Ok)) => {}
        Ok(Ok(Ack::Error(code))) => tracing::warn!("Settings dump rejected with error:{}", code),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => tracing::warn!("Timed out waiting for the settings dump to finish"),
    }

    for (id, value) in link.settings().snapshot().await {
        println!("${id}={value}");
    }
    link.close().await;
    Ok(())
}

async fn set_setting(config: &Config, id: u16, value: &str) -> Result<(), BoxError> {
    let link = connect(config).await?;
    let delay = config.streamer.settings_refresh_delay();
    let reported = link
        .settings()
        .write_setting_confirmed(&link, id, value, delay, delay + SETTINGS_DUMP_TIMEOUT)
        .await;
    link.close().await;
    match reported? {
        Some(current) => println!("${id}={current}"),
        None => return Err(format!("controller did not report ${id} back").into()),
    }
    Ok(())
}
