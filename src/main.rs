use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use wakenode::voice::{
    AudioCapture, AudioPlayback, EnergyVad, FrameSource, SPEECH_SAMPLE_RATE, VoiceActivityModel,
    list_input_devices,
};
use wakenode::{Config, Node};

/// Wakenode - wake word front end for a voice assistant router
#[derive(Parser)]
#[command(name = "wakenode", version, about)]
struct Cli {
    /// Node identity announced to the router and peers
    #[arg(short, long, env = "WAKENODE_NAME")]
    name: Option<String>,

    /// Router address (host:port)
    #[arg(short, long, env = "WAKENODE_ROUTER")]
    router: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write daily-rotated logs to this directory
    #[arg(long, env = "WAKENODE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input devices
    Devices,
    /// Show microphone level and voice activity
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Play a test tone
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.log_dir.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Console logging plus an optional rolling file
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 => "info,wakenode=info",
        1 => "info,wakenode=debug",
        2 => "debug",
        _ => "trace",
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "wakenode.log"));
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(name) = cli.name {
        config.name = name;
    }
    if let Some(router) = cli.router {
        config.router_address = router;
    }
    config.validate()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Devices => list_devices(),
            Command::TestMic { duration } => test_mic(&config, duration),
            Command::TestSpeaker => test_speaker(),
        };
    }

    tracing::debug!(?config, "loaded configuration");
    Node::new(config).run().await?;

    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let devices = list_input_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }

    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("{:3}: {}{marker}", device.index, device.name);
    }
    println!("\nSelect one with WAKENODE_INPUT_DEVICE=<index or name>");

    Ok(())
}

/// Print a level meter once per second
fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::open(&config.audio)?;
    let mut vad = EnergyVad::new(config.detector.vad_floor, config.detector.vad_ceiling);

    println!("Sample rate: {} Hz, frame: {} samples", config.audio.sample_rate, config.audio.chunk_size);
    println!("---");

    for second in 1..=duration {
        let until = Instant::now() + Duration::from_secs(1);
        let mut peak_rms = 0.0_f32;
        let mut peak_vad = 0.0_f32;
        let mut frames = 0_u32;

        while Instant::now() < until {
            if let Some(frame) = capture.read_frame(Duration::from_millis(100))? {
                frames += 1;
                peak_rms = peak_rms.max(frame.rms());
                peak_vad = peak_vad.max(vad.probability(&frame)?);
            }
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (peak_rms * 200.0).min(50.0) as usize;
        let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
        println!("[{second:2}s] RMS: {peak_rms:.4} | VAD: {peak_vad:.2} | frames: {frames:3} | [{meter}]");
    }

    let dropped = capture.take_dropped();
    println!("\n---");
    if dropped > 0 {
        println!("{dropped} frames dropped while the reader was behind");
    }
    println!("If the meter moved while you spoke, your mic is working!");
    println!("If VAD stays at 0 while speaking, lower WAKENODE_VAD_FLOOR.");

    Ok(())
}

/// Play two seconds of 440Hz
fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = AudioPlayback::new()?;
    let rate = SPEECH_SAMPLE_RATE;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..rate * 2)
        .map(|i| {
            let t = i as f32 / rate as f32;
            (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {rate} Hz...", samples.len());
    playback.play(&samples, rate)?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}
