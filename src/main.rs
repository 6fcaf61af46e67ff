use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use jarvis::audio::{
    AudioSource, CpalAudioSource, CpalSink, NullSink, Playback, PlaybackSink, SharedAudioSource,
};
use jarvis::effects::{AdapterEffectRunner, Adapters};
use jarvis::recognition::{SpeechRecognizer, UnsupportedRecognizer, WhisperRecognizer};
use jarvis::remote::OpenAiConnector;
use jarvis::responder::{Intent, Responder};
use jarvis::settings::{default_settings_path, load_settings, save_settings, AppSettings};
use jarvis::state_machine::Variant;
use jarvis::synthesis::{OpenAiSynthesizer, SpeechSynthesizer, TimedSynthesizer};
use jarvis::transcript::Sender;
use jarvis::{AssistantHandle, Notice};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    Offline,
    Remote,
}

impl From<VariantArg> for Variant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Offline => Variant::Offline,
            VariantArg::Remote => Variant::Remote,
        }
    }
}

/// Wake-word voice assistant
#[derive(Parser, Debug)]
#[command(name = "jarvis", version, about = "Wake-word voice assistant")]
struct Cli {
    /// Path to the settings file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Conversation variant
    #[arg(long, value_enum)]
    variant: Option<VariantArg>,

    /// Wake word override
    #[arg(long, value_name = "WORD")]
    wake_word: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => default_settings_path().context("locating settings file")?,
    };

    let mut settings = load_settings(&path);
    if !path.exists() {
        if let Err(e) = save_settings(&path, &settings) {
            log::warn!("Could not write default settings: {}", e);
        }
    }
    if let Some(variant) = cli.variant {
        settings.variant = variant.into();
    }
    if let Some(wake_word) = cli.wake_word {
        settings.wake_word = wake_word;
    }

    let handle = AssistantHandle::spawn(settings.machine_config(), build_runner(&settings));

    println!(
        "Jarvis ready ({:?}, wake word {:?}). Enter/t toggle, l listen, s stop speaking, q quit.",
        settings.variant, settings.wake_word
    );

    spawn_printers(&handle);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" | "t" => handle.toggle_system().await?,
            "s" => handle.stop_speaking().await?,
            "l" => handle.activate_listening().await?,
            "q" => break,
            other => println!("Unknown command {:?}", other),
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn build_runner(settings: &AppSettings) -> Arc<AdapterEffectRunner> {
    // Recognizer and volume meter read the same device stream
    let audio_source: Arc<dyn AudioSource> =
        Arc::new(SharedAudioSource::new(Arc::new(CpalAudioSource::new())));

    let sink: Arc<dyn PlaybackSink> = match CpalSink::open() {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            log::warn!("No audio output, playback disabled: {}", e);
            Arc::new(NullSink::new())
        }
    };
    let playback = Arc::new(Playback::new(sink));

    let recognizer: Arc<dyn SpeechRecognizer> = match WhisperRecognizer::from_env(
        audio_source.clone(),
        &settings.language,
        settings.capture_frame_ms,
    ) {
        Some(recognizer) => Arc::new(recognizer),
        None => {
            log::warn!("OPENAI_API_KEY not set, speech recognition unavailable");
            Arc::new(UnsupportedRecognizer)
        }
    };

    let prefs = settings.voice_preferences();
    let synthesizer: Arc<dyn SpeechSynthesizer> =
        match OpenAiSynthesizer::from_env(playback.clone(), &prefs) {
            Ok(synthesizer) => Arc::new(synthesizer),
            Err(e) => {
                log::info!("Using timed speech stand-in: {}", e);
                Arc::new(TimedSynthesizer::new(prefs))
            }
        };

    AdapterEffectRunner::new(Adapters {
        recognizer,
        synthesizer,
        audio_source,
        connector: Arc::new(OpenAiConnector::from_env()),
        playback,
        responder: Responder::new(settings.fallback_seed),
        remote: settings.remote_config(),
        capture_frame_ms: settings.capture_frame_ms,
    })
}

fn spawn_printers(handle: &AssistantHandle) {
    let mut state = handle.subscribe_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let ui = state.borrow_and_update().clone();
            match ui.error {
                Some(message) => println!("[{:?}] {}", ui.connection_state, message),
                None => println!("[{:?}]", ui.connection_state),
            }
        }
    });

    let mut transcripts = handle.subscribe_transcripts();
    tokio::spawn(async move {
        let mut printed = HashSet::new();
        while transcripts.changed().await.is_ok() {
            let items = transcripts.borrow_and_update().clone();
            for item in items.iter().filter(|i| i.is_complete) {
                if printed.insert(item.id.clone()) {
                    let who = match item.sender {
                        Sender::User => "you",
                        Sender::Assistant => "jarvis",
                    };
                    println!("{} {:>6}: {}", item.timestamp.format("%H:%M:%S"), who, item.text);
                }
            }
        }
    });

    let mut notices = handle.subscribe_notices();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(Notice::Intent(Intent::OpenUrl { url })) => open_url(&url),
                Ok(Notice::Cue(cue)) => log::debug!("Cue: {:?}", cue),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} notices", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn open_url(url: &str) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    log::info!("Opening {}", url);
    if let Err(e) = std::process::Command::new(opener).arg(url).spawn() {
        log::error!("Failed to open {}: {}", url, e);
    }
}
