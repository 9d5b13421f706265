//! Gateway server binary entry point
//!
//! Starts the signalling endpoint and the session registry. Browsers
//! negotiate over `POST /api/peer` and publish WebRTC media; the gateway
//! transcodes each session to RTMP, or forwards raw RTP over loopback UDP
//! when the forward ports are set.
//!
//! # Usage
//!
//! ```bash
//! # Terminate WebRTC publishes and push them to RTMP
//! gateway_server --listen-addr 0.0.0.0:5000
//!
//! # Use a self-hosted STUN server and a faster PLI cadence
//! gateway_server --stun-servers stun:stun.example.net:3478 --pli-interval-secs 1
//!
//! # Forward re-stamped RTP over loopback UDP instead of transcoding
//! gateway_server --udp-audio-port 4000 --udp-video-port 4002
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rtmp_gateway::config::GatewayConfig;
use rtmp_gateway::session::SessionRegistry;
use rtmp_gateway::signaling;

/// WebRTC to RTMP media gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the signalling endpoint listens on
    #[arg(long, default_value = "0.0.0.0:5000", env = "GATEWAY_LISTEN_ADDR")]
    listen_addr: String,

    /// STUN servers offered to peers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "GATEWAY_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// Seconds between keyframe (PLI) requests per track
    #[arg(long, default_value_t = 3, env = "GATEWAY_PLI_INTERVAL_SECS")]
    pli_interval_secs: u64,

    /// Path to the ffmpeg binary
    #[arg(long, default_value = "ffmpeg", env = "GATEWAY_FFMPEG_PATH")]
    ffmpeg_path: String,

    /// ffmpeg -loglevel value
    #[arg(long, default_value = "error", env = "GATEWAY_FFMPEG_LOG_LEVEL")]
    ffmpeg_log_level: String,

    /// Video bitrate in kbit/s for the transcoded stream
    #[arg(long, default_value_t = 3000, env = "GATEWAY_VIDEO_BITRATE_KBPS")]
    video_bitrate_kbps: u32,

    /// Forward audio RTP to this loopback UDP port instead of transcoding
    #[arg(long, requires = "udp_video_port", env = "GATEWAY_UDP_AUDIO_PORT")]
    udp_audio_port: Option<u16>,

    /// Forward video RTP to this loopback UDP port instead of transcoding
    #[arg(long, requires = "udp_audio_port", env = "GATEWAY_UDP_VIDEO_PORT")]
    udp_video_port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up the Ctrl+C handler before anything else so an early interrupt
    // is never lost.
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(1);
        }

        // Watchdog: if graceful shutdown stalls on encoder teardown or open
        // connections, force the exit.
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(5));
            eprintln!("Graceful shutdown timeout (5s), forcing exit");
            std::process::exit(1);
        });
    })
    .expect("Failed to set Ctrl+C handler");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("gateway-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> Result<()> {
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "RTMP gateway starting");

    let config = build_config(&args);
    config.validate()?;

    info!(
        listen_addr = %config.listen_addr,
        stun_servers = config.stun_servers.len(),
        pli_interval_secs = config.pli_interval_secs,
        udp_forward = config.udp_forward.is_some(),
        ffmpeg_path = %config.encoder.ffmpeg_path,
        video_bitrate_kbps = config.encoder.video_bitrate_kbps,
        "Configuration loaded"
    );

    let registry = SessionRegistry::start(config.clone());

    let shutdown_future = {
        let shutdown_flag = Arc::clone(&shutdown_flag);
        async move {
            while !shutdown_flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("Shutdown signal received, stopping signalling endpoint");
        }
    };

    signaling::http::serve(Arc::clone(&registry), &config.listen_addr, shutdown_future).await?;

    info!("Signalling stopped, draining sessions");
    registry.shutdown().await;

    info!("Gateway shutdown complete");
    Ok(())
}

fn build_config(args: &Args) -> GatewayConfig {
    let mut config = GatewayConfig::default()
        .with_listen_addr(args.listen_addr.clone())
        .with_stun_servers(args.stun_servers.clone())
        .with_pli_interval_secs(args.pli_interval_secs);

    config.encoder.ffmpeg_path = args.ffmpeg_path.clone();
    config.encoder.log_level = args.ffmpeg_log_level.clone();
    config.encoder.video_bitrate_kbps = args.video_bitrate_kbps;

    if let (Some(audio_port), Some(video_port)) = (args.udp_audio_port, args.udp_video_port) {
        config = config.with_udp_forward(audio_port, video_port);
    }

    config
}

fn init_tracing() {
    // EnvFilter honors RUST_LOG; default to info.
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
