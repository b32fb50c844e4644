use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_voice::events::UiEventType;
use beacon_voice::voice::{
    AudioPlayer, AudioSource, ConversationCoordinator, DEFAULT_FRAME_BYTES, ReaderSource,
    SpeechSynthesizer, VadClient, VadMode,
};
use beacon_voice::Config;

/// Beacon Voice - real-time conversational voice core
#[derive(Parser)]
#[command(name = "beacon-voice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or manage the pre-generated audio cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Talk to the VAD sidecar
    Vad {
        #[command(subcommand)]
        action: VadAction,
    },
    /// Run one wake word turn and print the response
    Wake,
    /// Listen continuously until Ctrl-C
    Listen {
        /// Read 16 kHz mono PCM16 from stdin instead of the microphone
        #[arg(long)]
        stdin: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache statistics
    Status,
    /// Generate missing or stale clips
    Generate,
    /// Delete every cached clip
    Clear,
    /// Load all clips into memory and report the size
    Preload,
}

#[derive(Subcommand)]
enum VadAction {
    /// Show the detector mode, or set it
    Mode {
        /// FULL or PLAYBACK
        mode: Option<VadMode>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_voice=info",
        1 => "info,beacon_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(
        cache_dir = %config.cache_dir.display(),
        vad = config.vad_enabled,
        tts = %config.tts.base_url,
        "loaded configuration"
    );

    match cli.command {
        Command::Cache { action } => cache(&config, action).await,
        Command::Vad {
            action: VadAction::Mode { mode },
        } => vad_mode(&config, mode).await,
        Command::Wake => wake(&config).await,
        Command::Listen { stdin } => listen(&config, stdin).await,
    }
}

async fn coordinator(config: &Config) -> anyhow::Result<ConversationCoordinator> {
    let synthesizer: Arc<dyn SpeechSynthesizer> = Arc::new(config.synthesizer()?);
    Ok(ConversationCoordinator::new(config.coordinator_config(), Some(synthesizer), speaker()).await)
}

#[cfg(feature = "device-audio")]
fn speaker() -> Option<Arc<dyn AudioPlayer>> {
    match beacon_voice::voice::DevicePlayer::new() {
        Ok(player) => Some(Arc::new(player)),
        Err(e) => {
            tracing::warn!(error = %e, "no speaker available, responses are text only");
            None
        }
    }
}

#[cfg(not(feature = "device-audio"))]
fn speaker() -> Option<Arc<dyn AudioPlayer>> {
    tracing::debug!("built without device-audio, responses are text only");
    None
}

#[cfg(feature = "device-audio")]
fn microphone() -> anyhow::Result<Box<dyn AudioSource>> {
    Ok(Box::new(beacon_voice::voice::MicrophoneSource::open(
        DEFAULT_FRAME_BYTES,
    )?))
}

#[cfg(not(feature = "device-audio"))]
fn microphone() -> anyhow::Result<Box<dyn AudioSource>> {
    anyhow::bail!("built without device-audio; use --stdin")
}

async fn cache(config: &Config, action: CacheAction) -> anyhow::Result<()> {
    let coordinator = coordinator(config).await?;

    match action {
        CacheAction::Status => {}
        CacheAction::Generate => {
            println!("Generating audio cache in {}...", config.cache_dir.display());
            coordinator.ensure_cache_ready().await?;
        }
        CacheAction::Clear => {
            coordinator.clear_cache().await?;
            println!("Cleared {}", config.cache_dir.display());
            return Ok(());
        }
        CacheAction::Preload => {
            let files = coordinator.cache().preload_all().await?;
            println!(
                "Preloaded {files} clips ({} bytes in memory)",
                coordinator.cache().memory_size()
            );
            return Ok(());
        }
    }

    let stats = coordinator.cache_stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn vad_mode(config: &Config, mode: Option<VadMode>) -> anyhow::Result<()> {
    let client = VadClient::new(config.vad.clone())?;

    if let Some(mode) = mode {
        client.set_mode(mode).await?;
    }

    println!("{}", client.get_mode().await?);
    Ok(())
}

async fn wake(config: &Config) -> anyhow::Result<()> {
    let coordinator = coordinator(config).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    coordinator.on_ui_event(Arc::new(move |event| {
        let _ = tx.send(event.event_type);
    }));

    let text = coordinator.handle_wake_word();
    println!("{text}");

    // Wait for the clip to finish before the runtime shuts down
    let mut speaking = false;
    loop {
        let wait = if speaking {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(3)
        };

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(UiEventType::Speaking)) => speaking = true,
            Ok(Some(UiEventType::Listening)) if speaking => break,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    Ok(())
}

async fn listen(config: &Config, stdin: bool) -> anyhow::Result<()> {
    let coordinator = coordinator(config).await?;
    coordinator.initialize_wake_word()?;

    coordinator.on_ui_event(Arc::new(|event| {
        tracing::info!(event = %event.event_type, state = %event.state, "ui event");
    }));
    coordinator.on_speech_detected(Arc::new(|capture| {
        tracing::info!(
            audio_bytes = capture.audio.len(),
            duration = ?capture.duration,
            "speech captured"
        );
    }));

    let responder = coordinator.clone();
    coordinator.on_wake_word_detected(Arc::new(move |detection| {
        tracing::info!(wake_word = %detection.wake_word, confidence = detection.confidence, "wake word");
        let text = responder.handle_wake_word();
        println!("{text}");
    }));

    let source: Box<dyn AudioSource> = if stdin {
        Box::new(ReaderSource::new(tokio::io::stdin(), DEFAULT_FRAME_BYTES))
    } else {
        microphone()?
    };

    coordinator.start_listening(source).await?;
    tracing::info!(persona = %coordinator.persona_name(), "listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    coordinator.stop_listening();
    coordinator.close_vad().await?;
    Ok(())
}
