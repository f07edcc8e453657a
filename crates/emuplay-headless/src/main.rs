use std::net::IpAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use emuplay_core::{RomInfo, demo::DemoMachine};
use emuplay_netplay::{ConnectionData, NetplayConfig, config::DEFAULT_PORT};
use emuplay_runtime::{
    EmulationContext, NotificationEvent, Runtime, RuntimeConfig, RuntimeHandle,
    SnapshotStoreConfig,
};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Headless emuplay session
#[derive(Parser, Debug)]
#[command(name = "emuplay")]
#[command(about = "Run the demo machine headless: host, join, record or replay", long_about = None)]
struct Args {
    /// ROM image whose identity tags snapshots and movies
    #[arg(long)]
    rom: Option<PathBuf>,

    /// Directory for save-state slot files
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Stop after this many frames (runs until the session ends when omitted)
    #[arg(long)]
    frames: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a netplay session
    Host {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Listen address
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Frames between sampling a client pad and the frame it drives
        #[arg(long, default_value_t = 2)]
        input_delay: u8,
    },
    /// Join a host
    Join {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(short, long, default_value = "player")]
        name: String,

        /// Avatar image sent to the host
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
    /// Record a movie from power-on
    Record { out: PathBuf },
    /// Replay a recorded movie
    Play { movie: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut ctx = EmulationContext::new(DemoMachine::new());
    if let Some(path) = &args.rom {
        let image = std::fs::read(path)
            .with_context(|| format!("failed to read ROM {}", path.display()))?;
        let rom = RomInfo::from_image(path, &image);
        info!(rom = %rom.name, "rom identity loaded");
        ctx = ctx.with_rom(rom);
    }

    let mut netplay = NetplayConfig::default();
    if let Command::Host {
        bind, input_delay, ..
    } = &args.command
    {
        netplay.bind_ip = *bind;
        netplay.input_delay = *input_delay;
    }
    let config = RuntimeConfig {
        netplay,
        snapshots: SnapshotStoreConfig {
            state_dir: args.state_dir.clone(),
            ..SnapshotStoreConfig::default()
        },
        ..RuntimeConfig::default()
    };

    let runtime = Runtime::initialize(config, ctx)?;
    let handle = runtime.handle();
    handle.subscribe(|ev: NotificationEvent| info!(event = ev.name(), "notification"));

    match &args.command {
        Command::Host { port, .. } => {
            handle.run()?;
            let addr = handle.start_server(*port)?;
            info!("hosting on {}", addr);
        }
        Command::Join {
            host,
            port,
            name,
            avatar,
        } => {
            let mut data = ConnectionData::new(host.clone(), *port, name.clone());
            if let Some(path) = avatar {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read avatar {}", path.display()))?;
                data = data.with_avatar(bytes);
            }
            handle.connect(data)?;
            handle.run()?;
            info!("joined {}:{}", host, port);
        }
        Command::Record { out } => {
            handle.movie_record(out.clone(), true)?;
            handle.run()?;
        }
        Command::Play { movie } => {
            handle.movie_play(movie.clone())?;
            handle.run()?;
        }
    }

    drive(&handle, &args);

    if matches!(args.command, Command::Record { .. }) {
        handle.movie_stop()?;
    }
    let hash = handle.state_hash()?;
    info!(frame = handle.frame(), state = %hash, "session finished");
    runtime.release();
    Ok(())
}

/// Block until the frame budget is spent or the session has nothing left to do.
fn drive(handle: &RuntimeHandle, args: &Args) {
    let first = handle.frame();
    let mut last_status = Instant::now();
    loop {
        thread::sleep(Duration::from_millis(20));
        let ran = handle.frame().saturating_sub(first);
        if args.frames.is_some_and(|limit| ran >= limit) {
            break;
        }
        match args.command {
            Command::Join { .. } if !handle.is_connected() => {
                warn!("host connection lost");
                break;
            }
            Command::Play { .. } if !handle.movie_playing() => break,
            _ => {}
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let peers = handle.peers().map(|p| p.len()).unwrap_or(0);
            info!(frame = handle.frame(), peers, "status");
        }
    }
}
