use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use bus_tracker_lib::trip::TripId;
use clap::{Parser, Subcommand};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracker_client::{
    backend::{HttpBackend, TrackerBackend},
    camera::HeadlessMap,
    channel::WsTransport,
    logging,
    sensor::{NmeaSensor, NmeaSource},
    ClientHandle, Notice, SessionState, TrackerConfig, TripSessionController,
};

#[derive(Parser)]
#[command(name = "bus-tracker")]
#[command(about = "Report a bus trip live, or follow one", long_about = None)]
struct Cli {
    /// Configuration file with `key = value` lines
    #[arg(long, env = "BUS_TRACKER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "BUS_TRACKER_BACKEND_URL")]
    backend_url: Option<String>,

    #[arg(long, env = "BUS_TRACKER_PUSH_URL")]
    push_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "BUS_TRACKER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume the open trip or start one on ROUTE, then report positions.
    /// Reads pause, resume, end, recenter and quit from stdin.
    Drive {
        #[arg(long)]
        route: String,
        /// NMEA log, serial device, or - for stdin
        #[arg(long, default_value = "-")]
        nmea: String,
    },
    /// Follow a trip and print its progress on every update
    Watch { trip_id: String },
    /// Print the trip the backend has open for this account
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    for (key, value) in [
        ("backend_url", &cli.backend_url),
        ("push_url", &cli.push_url),
        ("auth_token", &cli.token),
    ] {
        if let Some(value) = value {
            config.set(key, value)?;
        }
    }

    logging::init(config.log_file.as_deref()).context("Could not open log file")?;

    let backend = Arc::new(HttpBackend::new(&config.backend_url, config.auth_token.clone()));

    match cli.command {
        Commands::Status => {
            let status = backend
                .current_session()
                .await
                .context("Could not query current session")?;
            match status.trip_id {
                Some(trip_id) => println!("Active trip: {trip_id}"),
                None => println!("{}", status.message.as_deref().unwrap_or("No active trip")),
            }
        }
        Commands::Drive { route, nmea } => {
            let source = NmeaSource::from(nmea.as_str());
            let read_commands = source != NmeaSource::Stdin;
            let controller = TripSessionController::new(
                &config,
                backend,
                Arc::new(NmeaSensor::new(source)),
                Arc::new(WsTransport),
                Box::new(HeadlessMap::default()),
            );
            let (client, task) = controller.spawn();
            let result = drive(&client, &route, read_commands).await;
            client.shutdown();
            task.await?;
            result?;
        }
        Commands::Watch { trip_id } => {
            let controller = TripSessionController::new(
                &config,
                backend,
                // Never read when watching
                Arc::new(NmeaSensor::new(NmeaSource::Stdin)),
                Arc::new(WsTransport),
                Box::new(HeadlessMap::default()),
            );
            let (client, task) = controller.spawn();
            let result = watch(&client, TripId::new(trip_id)).await;
            client.shutdown();
            task.await?;
            result?;
        }
    }

    Ok(())
}

async fn drive(client: &ClientHandle, route: &str, read_commands: bool) -> anyhow::Result<()> {
    let mut notices = client.subscribe();

    match client.check_current_session().await? {
        SessionState::Active { trip_id, .. } => {
            println!("Resuming trip {trip_id}");
            client.toggle_reporting().await?;
        }
        _ => {
            let trip_id = client.start(route, None).await.context("Could not start trip")?;
            println!("Started trip {trip_id}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut read_commands = read_commands;

    loop {
        tokio::select! {
            line = lines.next_line(), if read_commands => {
                let Some(line) = line? else {
                    read_commands = false;
                    continue;
                };
                match line.trim() {
                    command @ ("pause" | "resume") => {
                        let want = command == "resume";
                        if let SessionState::Active { reporting, .. } = client.status().await? {
                            if reporting != want {
                                client.toggle_reporting().await?;
                            }
                        }
                    }
                    "recenter" => client.recenter()?,
                    "end" => {
                        client.end().await.context("Could not end trip")?;
                        println!("Trip ended");
                        return Ok(());
                    }
                    "quit" => return Ok(()),
                    "" => {}
                    other => println!("Unknown command: {other}"),
                }
            }
            notice = notices.recv() => {
                if !print_notice(notice, false) {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn watch(client: &ClientHandle, trip_id: TripId) -> anyhow::Result<()> {
    let mut notices = client.subscribe();
    client.watch(trip_id.clone()).await?;
    println!("Watching trip {trip_id}");

    loop {
        tokio::select! {
            notice = notices.recv() => {
                if !print_notice(notice, true) {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Prints one notice. Returns false once there is nothing left to follow.
fn print_notice(notice: Result<Notice, RecvError>, show_view: bool) -> bool {
    match notice {
        Ok(Notice::View(view)) if show_view => println!("{view}"),
        Ok(Notice::Session(SessionState::Active { reporting, .. })) => {
            println!("Reporting {}", if reporting { "on" } else { "paused" })
        }
        Ok(Notice::Error(err)) => eprintln!("Error: {err}"),
        Ok(Notice::TripEnded { trip_id, message }) => {
            println!("Trip {trip_id} ended{}", message.map(|m| format!(": {m}")).unwrap_or_default());
            return false;
        }
        Ok(_) => {}
        Err(RecvError::Lagged(skipped)) => {
            tracing::warn!("Missed {} notices", skipped);
        }
        Err(RecvError::Closed) => return false,
    }
    true
}
