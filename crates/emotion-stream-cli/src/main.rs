//! # emotion-gateway
//!
//! Command-line runner for the emotion streaming gateway.
//! `serve` runs the ingress WebSocket server; `capture` replays a directory
//! of JPEG frames through the adaptive capture client against a gateway.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use emotion_stream::recommend::{GeoLocation, NoRecommendations, Recommender, StaticRecommender};
use emotion_stream::{
    AdaptiveCaptureClient, CaptureConfig, CyclingFrames, GatewayConfig, GatewayEvent,
    StreamError, StreamGateway,
};

/// Real-time emotion streaming gateway.
#[derive(Parser)]
#[command(name = "emotion-gateway", version, about)]
struct Cli {
    /// Enable verbose logging (set RUST_LOG for fine-grained control)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway until Ctrl-C.
    Serve {
        /// Path to emotion-gateway.toml config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address override, e.g. 127.0.0.1:5000
        #[arg(long)]
        bind: Option<String>,

        /// Upstream inference WebSocket URL override
        #[arg(long)]
        upstream: Option<String>,

        /// Send bare emotion updates without outfit/food/music suggestions
        #[arg(long)]
        no_recommendations: bool,
    },

    /// Stream JPEG frames from a directory to a gateway and print results.
    Capture {
        /// Gateway stream URL
        #[arg(long, default_value = "ws://localhost:5000/api/emotion/stream")]
        url: String,

        /// Directory of .jpg/.jpeg files, replayed in name order
        #[arg(long)]
        frames: PathBuf,

        /// Latitude sent as location context
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,

        /// Longitude sent as location context
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "emotion_stream=debug,emotion_gateway=debug"
    } else {
        "emotion_stream=info,emotion_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Command::Serve {
            config,
            bind,
            upstream,
            no_recommendations,
        } => serve(config.as_deref(), bind, upstream, no_recommendations).await?,
        Command::Capture {
            url,
            frames,
            lat,
            lng,
        } => capture(url, &frames, lat.zip(lng)).await?,
    }
    Ok(())
}

async fn serve(
    config_path: Option<&Path>,
    bind: Option<String>,
    upstream: Option<String>,
    no_recommendations: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GatewayConfig::discover(config_path)?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(url) = upstream {
        config.upstream.url = url;
    }
    if config.upstream.api_key.is_none() {
        tracing::warn!("No upstream API key configured; connecting without credentials");
    }

    let recommender: Arc<dyn Recommender> = if no_recommendations {
        Arc::new(NoRecommendations)
    } else {
        Arc::new(StaticRecommender)
    };
    let gateway = StreamGateway::bind_with(config, recommender).await?;
    let mut events = gateway.handle().subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(GatewayEvent::SessionClosed(summary)) => match serde_json::to_string(&summary) {
                    Ok(json) => println!("{json}"),
                    Err(e) => tracing::warn!(error = %e, "Could not encode session summary"),
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Summary printer lagged behind gateway events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    gateway
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn capture(
    url: String,
    frames_dir: &Path,
    location: Option<(f64, f64)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let frames = load_frames(frames_dir).await?;
    println!("Loaded {} frame(s) from {}", frames.len(), frames_dir.display());

    let mut config = CaptureConfig::new(url);
    if let Some((lat, lng)) = location {
        config.location = Some(GeoLocation::new(lat, lng).ok_or_else(|| {
            StreamError::ConfigError {
                reason: format!("location out of range: {lat}, {lng}"),
            }
        })?);
    }

    let (mut client, mut updates) =
        AdaptiveCaptureClient::start(config, CyclingFrames::new(frames))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Some(update) => {
                    let label = update.emotion.unwrap_or_default();
                    match update.recommendations {
                        Some(rec) => println!(
                            "{label:<10} {} fps | outfit: {} | food: {} | music: {}",
                            client.current_fps(),
                            rec.outfit,
                            rec.food,
                            rec.music
                        ),
                        None => println!("{label:<10} {} fps", client.current_fps()),
                    }
                }
                None => break,
            },
        }
    }

    client.stop().await;
    Ok(())
}

async fn load_frames(dir: &Path) -> Result<Vec<Bytes>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_jpeg = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
        if is_jpeg {
            paths.push(path);
        }
    }
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        frames.push(Bytes::from(tokio::fs::read(&path).await?));
    }

    if frames.is_empty() {
        return Err(format!("no .jpg or .jpeg files in {}", dir.display()).into());
    }
    Ok(frames)
}
