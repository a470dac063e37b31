use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lokutor_voice::audio::{AudioDevice, AudioDeviceFactory, NullDevice};
use lokutor_voice::session::{Callbacks, Language, VoiceSession, VoiceStyle};
use lokutor_voice::synthesis::{write_wav, MetadataHandler};
use lokutor_voice::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lokutor")]
#[command(about = "Real-time voice conversations and text-to-speech")]
struct Cli {
    /// Configuration file (TOML); LOKUTOR__* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// API key (falls back to LOKUTOR_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Server URL
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Talk with the voice agent
    Chat {
        /// System prompt for the agent
        #[arg(short, long)]
        prompt: Option<String>,

        /// Voice style (F1-F5, M1-M5)
        #[arg(short, long)]
        voice: Option<VoiceStyle>,

        /// Language code (en, es, fr, pt, ko)
        #[arg(short, long)]
        language: Option<Language>,
    },

    /// Synthesize text to speech
    Tts {
        /// Text to speak
        text: String,

        /// Voice style (F1-F5, M1-M5)
        #[arg(short, long)]
        voice: Option<VoiceStyle>,

        /// Language code (en, es, fr, pt, ko)
        #[arg(short, long)]
        language: Option<Language>,

        /// Speech speed
        #[arg(long)]
        speed: Option<f32>,

        /// Inference steps (quality)
        #[arg(long)]
        steps: Option<u32>,

        /// Request viseme metadata and print it
        #[arg(long)]
        visemes: bool,

        /// Write the audio to a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Don't play the audio
        #[arg(long)]
        no_play: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(key) = cli.api_key.or_else(|| std::env::var("LOKUTOR_API_KEY").ok()) {
        cfg.service.api_key = key;
    }
    if cfg.service.api_key.is_empty() {
        warn!("No API key set; use --api-key or LOKUTOR_API_KEY");
    }

    info!("Lokutor Voice v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Chat {
            prompt,
            voice,
            language,
        } => {
            if let Some(url) = cli.url {
                cfg.service.agent_url = url;
            }
            if let Some(prompt) = prompt {
                cfg.agent.prompt = prompt;
            }
            if let Some(voice) = voice {
                cfg.agent.voice = voice;
            }
            if let Some(language) = language {
                cfg.agent.language = language;
            }
            chat(&cfg).await
        }
        Command::Tts {
            text,
            voice,
            language,
            speed,
            steps,
            visemes,
            output,
            no_play,
        } => {
            if let Some(url) = cli.url {
                cfg.service.tts_url = url;
            }
            if let Some(voice) = voice {
                cfg.agent.voice = voice;
            }
            if let Some(language) = language {
                cfg.agent.language = language;
            }
            if let Some(speed) = speed {
                cfg.tts.speed = speed;
            }
            if let Some(steps) = steps {
                cfg.tts.steps = steps;
            }
            cfg.tts.visemes |= visemes;
            tts(&cfg, text, output, !no_play).await
        }
    }
}

async fn chat(cfg: &Config) -> Result<()> {
    let device = AudioDeviceFactory::create().context("Failed to create audio device")?;

    let callbacks = Callbacks::new()
        .on_transcription(|text| println!("You: {text}"))
        .on_response(|text| println!("Agent: {text}"))
        .on_error(|e| eprintln!("Error: {e}"));

    let session = Arc::new(VoiceSession::new(cfg.session_config(), device).with_observer(callbacks));

    info!("Voice: {}, language: {}", cfg.agent.voice, cfg.agent.language);
    info!("Press Ctrl+C to end the conversation");

    let interrupt = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                session.disconnect().await;
            }
        })
    };

    let result = session.start_conversation().await;
    interrupt.abort();
    session.disconnect().await;

    let stats = session.stats();
    info!(
        "Session {} lasted {:.1}s: {} frames sent, {} received, {} interruptions",
        stats.session_id,
        stats.duration_secs,
        stats.frames_sent,
        stats.frames_received,
        stats.interruptions
    );

    if let Err(e) = &result {
        error!("Conversation failed: {}", e);
    }
    result.context("Voice session ended with an error")
}

async fn tts(cfg: &Config, text: String, output: Option<PathBuf>, play: bool) -> Result<()> {
    // Audio written to disk is collected instead of played.
    let play = play && output.is_none();
    let device: Arc<dyn AudioDevice> = if play {
        AudioDeviceFactory::create().context("Failed to create audio device")?
    } else {
        Arc::new(NullDevice)
    };

    let options = cfg.synthesis_options(text).with_play(play);
    let on_metadata: Option<MetadataHandler> = if cfg.tts.visemes {
        Some(Arc::new(|data: &serde_json::Value| println!("Visemes: {data}")))
    } else {
        None
    };

    let report = cfg
        .tts_client()
        .synthesize(&options, device, on_metadata)
        .await
        .context("Synthesis failed")?;

    if let Some(path) = output {
        write_wav(&path, &report.frames, cfg.audio.output_sample_rate)?;
        info!("Saved {} frames to {}", report.frames.len(), path.display());
    }

    Ok(())
}
