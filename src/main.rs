mod command;
mod config;
mod relay;
mod signals;
mod stats;
mod status;
mod supervisor;
mod timer;
mod watchdog;

use clap::Parser;
use config::RelayConfig;
use relay::PacketRelay;
use signals::{Shutdown, ShutdownReason};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::ProcessSupervisor;
use tracing_subscriber::EnvFilter;
use watchdog::IdleWatchdog;

/// Relay an HDMI-over-IP UDP stream (e.g. from an LKV373A encoder) into an
/// ffmpeg transcoder that only runs while traffic is flowing.
#[derive(Parser, Debug)]
#[command(name = "lkv-relay", version, about)]
pub struct Cli {
    /// Target RTMP URL for the transcoded stream
    #[arg(value_name = "RTMP_URL")]
    stream_endpoint: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Target bitrate for transcoded stream in kbps
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Path to ffmpeg executable to use
    #[arg(short = 'F', long)]
    ffmpeg: Option<String>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Target framerate for transcoded stream
    #[arg(short = 'r', long)]
    framerate: Option<u32>,

    /// Target video dimensions for transcoded stream as x:y
    #[arg(short, long)]
    scale: Option<String>,

    /// Target transcoding profile
    #[arg(short = 'P', long, value_enum)]
    profile: Option<command::Profile>,

    /// Seconds without traffic before the transcoder is stopped
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Less logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// More logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print resolved settings and the transcoder command, don't run
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    /// CLI flags win over the config file.
    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(endpoint) = &self.stream_endpoint {
            config.encoder.endpoint = endpoint.clone();
        }
        if let Some(bitrate) = self.bitrate {
            config.encoder.bitrate = bitrate;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.encoder.ffmpeg = ffmpeg.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen.address = listen.clone();
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(framerate) = self.framerate {
            config.encoder.framerate = framerate;
        }
        if let Some(scale) = &self.scale {
            config.encoder.scale = scale.clone();
        }
        if let Some(profile) = self.profile {
            config.encoder.profile = profile;
        }
        if let Some(timeout) = self.timeout {
            config.watchdog.timeout_secs = timeout;
        }
    }

    /// Default INFO; each -v steps down to DEBUG/TRACE, each -q up to WARN/ERROR.
    fn log_level(&self) -> &'static str {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        let idx = (2 + i32::from(self.quiet) - i32::from(self.verbose)).clamp(0, 4);
        LEVELS[idx as usize]
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lkv_relay={}", cli.log_level())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match RelayConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let cmd = command::build_command(&config.encoder);

    if cli.dry_run {
        println!("lkv-relay v{}", env!("CARGO_PKG_VERSION"));
        println!("Listen:    udp://{}", config.listen_addr());
        println!("Timeout:   {:.1}s", config.watchdog.timeout_secs);
        println!("Profile:   {:?}", config.encoder.profile);
        println!("Command:   {}", cmd.join(" "));
        return ExitCode::SUCCESS;
    }

    match run(config, cmd).await {
        Ok(ShutdownReason::Signal) => ExitCode::SUCCESS,
        Ok(ShutdownReason::LaunchFailure) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: RelayConfig, cmd: Vec<String>) -> Result<ShutdownReason, relay::RelayError> {
    let shutdown = Shutdown::new();

    let mut supervisor = ProcessSupervisor::new(cmd, shutdown.clone());
    if let Some(path) = &config.status.file {
        supervisor = supervisor.with_status_file(path.clone());
    }
    let supervisor = Arc::new(supervisor);

    let addr = relay::resolve(&config.listen_addr()).await?;
    let packet_relay = PacketRelay::bind(addr, config.listen.recv_buffer_bytes)?;

    let signal_handler = signals::SignalHandler::install().map_err(relay::RelayError::Signals)?;

    let watchdog = IdleWatchdog::new(Arc::clone(&supervisor), config.watchdog.timeout());
    let watchdog_task = tokio::spawn(watchdog.run(shutdown.clone()));
    let signal_task = tokio::spawn(signal_handler.run(shutdown.clone(), Arc::clone(&supervisor)));

    let result = packet_relay.run(Arc::clone(&supervisor), shutdown.clone()).await;
    // The listener has returned; make sure every other task winds down too.
    shutdown.trigger(ShutdownReason::Signal);

    supervisor.stop().await;
    supervisor.mark_shutting_down().await;
    if let Err(e) = watchdog_task.await {
        tracing::warn!(error = %e, "watchdog task failed");
    }
    match signal_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "signal handling failed"),
        Err(e) => tracing::warn!(error = %e, "signal task failed"),
    }

    match result {
        Ok(()) | Err(relay::RelayError::Launch(_)) => {
            Ok(shutdown.reason().unwrap_or(ShutdownReason::Signal))
        }
        Err(e) => Err(e),
    }
}
