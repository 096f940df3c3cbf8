use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vcall::audio::NullSink;
use vcall::config::ConfigStore;
use vcall::devices::ProcessCaptureDevices;
use vcall::events::EventBus;
use vcall::session::{CallController, CallServices};
use vcall::video::decoder::DecoderProbe;
use vcall::video::NoHardwareBackend;
use vcall::webrtc::{signaling_channel, SignalingEvent, WebRtcTransportFactory};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// vcall command line arguments
#[derive(Parser, Debug)]
#[command(name = "vcall")]
#[command(version, about = "Media session layer for SFU voice/video calls", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "vcall.json")]
    config: PathBuf,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a channel; signaling is exchanged as JSON lines on stdin/stdout
    Run {
        /// Voice channel to join
        #[arg(long)]
        channel: String,

        /// Local user id as known to the signaling server
        #[arg(long)]
        user: String,

        /// Start the camera after joining
        #[arg(long)]
        camera: bool,

        /// Join muted
        #[arg(long)]
        muted: bool,
    },

    /// Report decoder capabilities
    Probe,

    /// List the capture program's cameras, displays and microphones
    Sources,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting vcall v{}", env!("CARGO_PKG_VERSION"));
    let config = ConfigStore::load(&args.config).await?;

    match args.command {
        Command::Run {
            channel,
            user,
            camera,
            muted,
        } => run(config, channel, user, camera, muted).await,
        Command::Probe => {
            let probe = DecoderProbe::global(&config.get().decoder.program);
            println!("{}", serde_json::to_string_pretty(probe)?);
            Ok(())
        }
        Command::Sources => {
            let sources = ProcessCaptureDevices::new(config).list_sources().await?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
            Ok(())
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&*config.get())?);
            Ok(())
        }
    }
}

async fn run(
    config: ConfigStore,
    channel: String,
    user: String,
    camera: bool,
    muted: bool,
) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new());
    let (link, mut remote) = signaling_channel(64);

    let controller = CallController::new(
        user,
        config.clone(),
        CallServices {
            transports: Arc::new(WebRtcTransportFactory::new(config.clone())),
            devices: Arc::new(ProcessCaptureDevices::new(config.clone())),
            hardware: Arc::new(NoHardwareBackend),
            audio_sink: Arc::new(NullSink),
            events: events.clone(),
        },
        link.commands,
    );
    let signaling_task = controller.run_signaling(link.events);

    // Single writer so commands and events never interleave mid-line
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let command_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(command) = remote.commands.recv().await {
            match serde_json::to_string(&command) {
                Ok(line) => {
                    if command_out.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Unserializable signaling command: {}", e),
            }
        }
    });

    let mut event_rx = events.subscribe();
    let event_out = out_tx.clone();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let Ok(line) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if event_out.send(line).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event output lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let signaling_in = remote.events;
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<SignalingEvent>(&line) {
                    Ok(event) => {
                        if signaling_in.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring malformed signaling line: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Reading signaling input failed: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("Signaling input closed");
    });

    controller.set_muted(muted).await;
    controller.join(&channel, Vec::new()).await?;
    if camera {
        if let Err(e) = controller.set_camera(true).await {
            tracing::warn!("Camera not started: {}", e);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    controller.leave().await;

    signaling_task.abort();
    drop(out_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    Ok(())
}

/// Initialize logging to stderr; stdout carries the signaling stream
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vcall=error,webrtc=error",
        LogLevel::Warn => "vcall=warn,webrtc=warn",
        LogLevel::Info => "vcall=info,webrtc=warn",
        LogLevel::Verbose => "vcall=debug,webrtc=warn",
        LogLevel::Debug => "vcall=debug,webrtc=info",
        LogLevel::Trace => "vcall=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
