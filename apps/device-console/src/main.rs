mod telemetry;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use device_relay::config::websocket_url;
use device_relay::{
    AudioTarget, ChannelPool, Command, CommandClient, DeviceViewer, RelayConfig, ViewerEvent,
    ViewerMode, ViewerOptions,
};
use tracing::{info, warn};
use url::Url;

use telemetry::{LogConfig, LogLevel};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "device-console", version, about = "Watch and command remote devices through the relay")]
struct Cli {
    /// Relay websocket endpoint.
    #[arg(long, env = "DEVICE_RELAY_URL", global = true)]
    relay_url: Option<String>,

    /// Base URL of the command API.
    #[arg(long, env = "DEVICE_API_URL", global = true)]
    api_url: Option<String>,

    #[arg(long, env = "DEVICE_API_TOKEN", global = true, hide_env_values = true)]
    api_token: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    log_level: LogLevel,

    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Attach to a device and print what it streams.
    Watch(WatchArgs),
    /// Send one command to a device.
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    device: String,
    #[arg(long)]
    camera: bool,
    #[arg(long)]
    capture: bool,
    #[arg(long)]
    screenshot: bool,
    #[arg(long)]
    recorded_audio: bool,
    /// Record the live audio stream to this WAV file.
    #[arg(long)]
    audio_out: Option<PathBuf>,
    /// Play the live audio stream on the default output device.
    #[arg(long, conflicts_with = "audio_out")]
    play: bool,
    /// Answer the device's WebRTC offer.
    #[arg(long)]
    webrtc: bool,
    /// Write snapshots here instead of keeping them in memory.
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Command to send once attached; repeatable.
    #[arg(long = "trigger")]
    triggers: Vec<String>,
    /// Reconnect attempts after the relay drops the channel.
    #[arg(long, default_value_t = 3)]
    reconnect: u32,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long)]
    device: String,
    command: String,
}

impl WatchArgs {
    fn modes(&self) -> Vec<ViewerMode> {
        let picked: Vec<ViewerMode> = [
            (self.camera, ViewerMode::CameraFrame),
            (self.capture, ViewerMode::Capture),
            (self.screenshot, ViewerMode::Screenshot),
            (self.recorded_audio, ViewerMode::RecordedAudio),
        ]
        .into_iter()
        .filter_map(|(on, mode)| on.then_some(mode))
        .collect();
        let nothing_else = self.audio_target().is_none() && !self.webrtc;
        if picked.is_empty() && nothing_else {
            ViewerMode::ALL.to_vec()
        } else {
            picked
        }
    }

    fn audio_target(&self) -> Option<AudioTarget> {
        if self.play {
            return Some(AudioTarget::Device);
        }
        self.audio_out.clone().map(AudioTarget::Wav)
    }

    fn viewer_options(&self, config: &RelayConfig) -> ViewerOptions {
        ViewerOptions {
            snapshots: self.modes(),
            snapshot_dir: self.out_dir.clone(),
            keep_last_snapshot: self.out_dir.is_some(),
            audio: self.audio_target(),
            webrtc: self.webrtc,
            ..ViewerOptions::from_config(config)
        }
    }
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = RelayConfig::from_env().context("invalid DEVICE_* environment")?;
    if let Some(raw) = cli.relay_url.as_deref() {
        config.channel.relay_url = websocket_url(raw).context("invalid --relay-url")?;
    }
    if let Some(raw) = cli.api_url.as_deref() {
        config.api_url = Url::parse(raw).context("invalid --api-url")?;
    }
    if cli.api_token.is_some() {
        config.api_token = cli.api_token.clone();
    }
    Ok(config)
}

fn backoff(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

fn describe(event: &ViewerEvent) -> String {
    match event {
        ViewerEvent::Snapshot { device, snapshot } => {
            let mut line = format!(
                "[{device}] {} #{} {} bytes",
                snapshot.kind.as_str(),
                snapshot.sequence,
                snapshot.bytes.len()
            );
            if let Some(audio) = snapshot.audio {
                line.push_str(&format!(
                    " ({:.2}s @ {} Hz)",
                    audio.duration_secs, audio.sample_rate
                ));
            }
            if let Some(path) = &snapshot.location {
                line.push_str(&format!(" -> {}", path.display()));
            }
            line
        }
        ViewerEvent::AudioScheduled { device, chunk } => format!(
            "[{device}] audio {:.3}s at {:.3}s{}",
            chunk.duration,
            chunk.start,
            if chunk.clamped { " (underrun)" } else { "" }
        ),
        ViewerEvent::Track { device, track } => {
            format!("[{device}] {:?} track {} ready", track.kind, track.id)
        }
        ViewerEvent::Waiting { device, mode } => format!("[{device}] waiting for {:?}", mode),
        ViewerEvent::StreamingFailed { device, error } => {
            format!("[{device}] streaming failed: {error}")
        }
        ViewerEvent::ChannelLost { device, error } => format!("[{device}] channel lost: {error}"),
        ViewerEvent::Decode { device, action, error } => {
            format!("[{device}] dropped {action}: {error}")
        }
        ViewerEvent::UnknownAction { device, action } => {
            format!("[{device}] unhandled action {action}")
        }
        ViewerEvent::Closed { device } => format!("[{device}] closed"),
    }
}

async fn send_triggers(config: &RelayConfig, device: &str, triggers: &[String]) -> Result<()> {
    if triggers.is_empty() {
        return Ok(());
    }
    let client = CommandClient::new(&config.api_url, config.api_token.clone())?;
    for raw in triggers {
        let command: Command = raw.parse().unwrap_or_else(|never| match never {});
        match client.send(device, &command).await {
            Ok(receipt) => println!("[{device}] {command}: {:?}", receipt.status),
            Err(err) => warn!(device = %device, command = %command, error = %err, "trigger failed"),
        }
    }
    Ok(())
}

async fn rebind(viewer: &mut DeviceViewer, device: &str, attempts: u32) -> Result<()> {
    for attempt in 0..attempts {
        let delay = backoff(attempt);
        info!(device = %device, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
        match viewer.switch_device(device).await {
            Ok(()) => return Ok(()),
            Err(err) => warn!(device = %device, error = %err, "reconnect failed"),
        }
    }
    bail!("relay channel for {device} lost after {attempts} reconnect attempts")
}

async fn watch(config: RelayConfig, args: WatchArgs) -> Result<()> {
    let options = args.viewer_options(&config);
    let pool = ChannelPool::new(config.channel.clone());
    let (mut viewer, mut events) = DeviceViewer::open(pool, &args.device, options)
        .await
        .with_context(|| format!("failed to attach to {}", args.device))?;
    println!("watching {} via {}", args.device, config.channel.relay_url);
    send_triggers(&config, &args.device, &args.triggers).await?;

    let result = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break Ok(());
        };
        println!("{}", describe(&event));
        if let ViewerEvent::ChannelLost { .. } = event {
            if let Err(err) = rebind(&mut viewer, &args.device, args.reconnect).await {
                break Err(err);
            }
        }
    };
    viewer.close().await;
    result
}

async fn send(config: RelayConfig, args: SendArgs) -> Result<()> {
    let client = CommandClient::new(&config.api_url, config.api_token.clone())?;
    let command: Command = args.command.parse().unwrap_or_else(|never| match never {});
    let receipt = client
        .send(&args.device, &command)
        .await
        .with_context(|| format!("failed to send {command} to {}", args.device))?;
    println!("{} {}: {:?}", args.device, command, receipt.status);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;
    let config = load_config(&cli)?;
    if cli.api_token.is_none() && config.api_token.is_none() {
        if let Commands::Send(_) = cli.command {
            bail!("DEVICE_API_TOKEN or --api-token is required to send commands");
        }
    }

    match cli.command {
        Commands::Watch(args) => watch(config, args).await,
        Commands::Send(args) => send(config, args).await,
    }
}
