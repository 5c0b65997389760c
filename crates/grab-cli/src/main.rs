mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use grab_api::state::AppState;
use grab_core::orchestrator::PRESIGNED_PATH;
use grab_core::{ConvertRequest, GrabError, GrantParams, GrantSigner, HttpLoader, Orchestrator};

use crate::config::{AppConfig, GRANT_SECRET_ENV};

fn version_string() -> &'static str {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    const GIT_HASH: &str = env!("GIT_HASH");

    if GIT_HASH.is_empty() {
        // called once, lives for the whole process
        Box::leak(VERSION.to_string().into_boxed_str())
    } else {
        Box::leak(format!("{VERSION} ({GIT_HASH})").into_boxed_str())
    }
}

/// media-grab: find, convert and hand out downloadable videos.
#[derive(Parser)]
#[command(name = "media-grab", version = version_string(), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server.
    Serve {
        /// Listen address (e.g. 0.0.0.0:8080). Overrides config file.
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Path to TOML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List the videos found on a page (no API server).
    Extract {
        /// Page URL.
        url: String,

        /// Print the full result as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Path to TOML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Convert a segmented stream into an MP4 file.
    Convert {
        /// Master or media playlist URL (.m3u8).
        url: String,

        /// Page the stream was found on. Lets the primary tool resolve it itself.
        #[arg(long)]
        source_url: Option<String>,

        /// Height ceiling such as 720p, or "best".
        #[arg(short, long)]
        quality: Option<String>,

        /// Output file.
        #[arg(short, long, default_value = "video.mp4")]
        output: PathBuf,

        /// Path to TOML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Issue a presigned grant.
    Sign {
        /// Path or URL the grant covers.
        path: String,

        /// Size in bytes.
        size: u64,

        /// Origin domain of the target.
        domain: String,

        /// Signing secret. Falls back to GRAB_GRANT_SECRET.
        #[arg(long)]
        secret: Option<String>,

        /// Grant lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,

        /// Endpoint the download URL points at.
        #[arg(long, default_value = PRESIGNED_PATH)]
        endpoint: String,
    },
    /// Check a presigned grant URL or query string.
    Verify {
        grant: String,

        /// Signing secret. Falls back to GRAB_GRANT_SECRET.
        #[arg(long)]
        secret: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen, config } => {
            run_serve(listen, config).await;
        }
        Commands::Extract { url, json, config } => {
            init_quiet_tracing();
            run_extract(url, json, config).await;
        }
        Commands::Convert {
            url,
            source_url,
            quality,
            output,
            config,
        } => {
            init_quiet_tracing();
            let request = ConvertRequest {
                url,
                source_url,
                quality,
            };
            run_convert(request, output, config).await;
        }
        Commands::Sign {
            path,
            size,
            domain,
            secret,
            ttl_secs,
            endpoint,
        } => {
            let signer = GrantSigner::new(require_secret(secret), Duration::from_secs(ttl_secs.max(1)));
            let grant = signer.issue(&path, size, &domain);
            println!("{}", grant.download_url(&endpoint));
            eprintln!(
                "{} {}",
                style("expires:").dim(),
                chrono_millis(grant.expires)
            );
        }
        Commands::Verify { grant, secret } => {
            let signer = GrantSigner::new(require_secret(secret), Duration::from_secs(3600));
            let query = grant.split_once('?').map(|(_, q)| q).unwrap_or(&grant);
            match signer.verify(&grant_params(query)) {
                Ok(v) => {
                    println!("{}", style("valid").green().bold());
                    println!("  {} {}", style("path:   ").dim(), v.path);
                    println!("  {} {}", style("size:   ").dim(), v.size);
                    println!("  {} {}", style("domain: ").dim(), v.domain);
                    println!("  {} {}", style("expires:").dim(), chrono_millis(v.expires));
                }
                Err(e) => {
                    println!("{} {}", style("invalid").red().bold(), e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> AppConfig {
    match path {
        Some(path) => match AppConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{} {}", style("error:").red().bold(), e);
                std::process::exit(1);
            }
        },
        None => AppConfig::default(),
    }
}

fn require_secret(arg: Option<String>) -> String {
    arg.or_else(|| std::env::var(GRANT_SECRET_ENV).ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            eprintln!(
                "{} a secret is required (--secret or {})",
                style("error:").red().bold(),
                GRANT_SECRET_ENV
            );
            std::process::exit(2);
        })
}

/// Random per-process secret; grants do not survive a restart.
fn ephemeral_secret() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

fn build_orchestrator(app_config: &AppConfig, secret: &str) -> Orchestrator {
    let grab = app_config.grab_config();
    let loader = Arc::new(HttpLoader::from_config(&grab));
    let signer = GrantSigner::new(secret, grab.grant_ttl);
    let orchestrator = Orchestrator::new(grab, loader, signer);
    match app_config.server.public_base_url {
        Some(ref base) => orchestrator.with_public_base_url(base.clone()),
        None => orchestrator,
    }
}

async fn run_serve(listen_override: Option<SocketAddr>, config_path: Option<PathBuf>) {
    let app_config = if let Some(ref path) = config_path {
        match AppConfig::load(path) {
            Ok(c) => {
                init_tracing(&c.server.log_format);
                tracing::info!(path = %path.display(), "Loaded config file");
                c
            }
            Err(e) => {
                init_tracing("pretty");
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
    } else {
        init_tracing("pretty");
        AppConfig::default()
    };

    let listen = listen_override.unwrap_or(app_config.server.listen);

    let secret = app_config.grant_secret().unwrap_or_else(|| {
        tracing::warn!(
            "No grant secret configured ({} or [grant].secret); using a random one",
            GRANT_SECRET_ENV
        );
        ephemeral_secret()
    });

    let mut state = AppState::new(build_orchestrator(&app_config, &secret))
        .with_admission(app_config.admission());
    if let Some(ref token) = app_config.server.admin_token {
        state = state.with_admin_token(token.clone());
    }

    tracing::info!(%listen, "Starting media-grab API server");
    if let Err(e) = grab_api::serve_with_state(listen, state, grab_api::shutdown_signal()).await {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }
    tracing::info!("Shutdown complete");
}

async fn run_extract(url: String, json: bool, config_path: Option<PathBuf>) {
    let app_config = load_config(config_path.as_deref());
    let orchestrator = build_orchestrator(&app_config, &ephemeral_secret());
    let cancel = cancel_on_ctrl_c();

    let spinner = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("valid template"),
    );
    spinner.set_message(format!("Extracting {}", style(&url).bold()));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = orchestrator.submit(&url, &cancel).await;
    spinner.finish_and_clear();

    let result = match result {
        Ok(r) => r,
        Err(e) => exit_with(e),
    };

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("{} {}", style("error:").red().bold(), e);
                std::process::exit(1);
            }
        }
        return;
    }

    if result.videos.is_empty() {
        println!("{}", style("No videos found on this page").yellow());
        return;
    }

    println!(
        "{} {} via {}",
        style(format!("{} video(s)", result.videos.len())).bold(),
        style("found").green(),
        style(result.strategy.as_deref().unwrap_or("-")).dim()
    );
    for (i, video) in result.videos.iter().enumerate() {
        let kind = if video.is_segmented {
            style(format!("{:<5}", video.format)).cyan()
        } else {
            style(format!("{:<5}", video.format)).green()
        };
        println!(
            "  {:>2}. {:<8} {}  {}",
            i + 1,
            video.quality,
            kind,
            video.url
        );
    }
}

async fn run_convert(request: ConvertRequest, output: PathBuf, config_path: Option<PathBuf>) {
    let app_config = load_config(config_path.as_deref());
    let orchestrator = build_orchestrator(&app_config, &ephemeral_secret());
    let cancel = cancel_on_ctrl_c();

    let bar = ProgressBar::new(100).with_style(
        ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("valid template")
            .progress_chars("=> "),
    );
    bar.set_message(format!("Converting {}", style(&request.url).bold()));
    bar.enable_steady_tick(Duration::from_millis(120));

    let progress = {
        let bar = bar.clone();
        move |fraction: f64| bar.set_position((fraction.clamp(0.0, 1.0) * 100.0).round() as u64)
    };

    let artifact = match orchestrator.transcode(&request, &progress, &cancel).await {
        Ok(a) => a,
        Err(e) => {
            bar.abandon_with_message(style("conversion failed").red().to_string());
            exit_with(e);
        }
    };

    match artifact.persist_to(&output).await {
        Ok(size) => {
            bar.finish_with_message(format!(
                "{} {} ({:.1} MiB)",
                style("saved").green().bold(),
                output.display(),
                size as f64 / (1024.0 * 1024.0)
            ));
        }
        Err(e) => {
            bar.abandon();
            eprintln!(
                "{} could not write {}: {}",
                style("error:").red().bold(),
                output.display(),
                e
            );
            std::process::exit(1);
        }
    }
}

fn exit_with(err: GrabError) -> ! {
    eprintln!("{} {}", style("error:").red().bold(), err);
    if let GrabError::Transcode {
        hint: Some(ref hint),
        ..
    } = err
    {
        eprintln!("  {} {}", style("hint:").yellow(), hint);
    }
    std::process::exit(1);
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        grab_api::shutdown_signal().await;
        token.cancel();
    });
    cancel
}

fn grant_params(query: &str) -> GrantParams {
    let mut params = GrantParams::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Some(value.into_owned());
        match key.as_ref() {
            "path" => params.path = value,
            "size" => params.size = value,
            "domain" => params.domain = value,
            "expires" => params.expires = value,
            "signature" => params.signature = value,
            _ => {}
        }
    }
    params
}

fn chrono_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn init_quiet_tracing() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

fn init_tracing(log_format: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_format {
        "json" => {
            fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_secret_is_fresh_256_bit_hex() {
        let a = ephemeral_secret();
        let b = ephemeral_secret();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
