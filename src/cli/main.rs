//! Background removal server entry point
//!
//! Parses the command line, installs the tracing subscriber, builds the
//! dispatch service and serves it until Ctrl-C / SIGTERM.

use super::config::CliConfigBuilder;
use crate::cache::{format_size, ModelCache};
use crate::server;
use crate::service::InferenceDispatchService;
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Background removal inference server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgremove-server")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "BGREMOVE_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Execution provider: auto, cpu, cuda or coreml
    #[arg(long, env = "BGREMOVE_DEVICE", default_value = "auto")]
    pub device: String,

    /// Weight precision (fp32, fp16) [default: fp16 on accelerators, fp32 on CPU]
    #[arg(long, env = "BGREMOVE_PRECISION")]
    pub precision: Option<String>,

    /// Maximum concurrent inference runs on the accelerator
    #[arg(long, env = "BGREMOVE_GATE_CAPACITY", default_value_t = 2)]
    pub gate_capacity: usize,

    /// Model used when a request does not name one
    #[arg(long, env = "BGREMOVE_DEFAULT_MODEL", default_value = "rmbg2")]
    pub default_model: String,

    /// Per-request inference budget in seconds
    #[arg(long, env = "BGREMOVE_INFERENCE_TIMEOUT_SECS", default_value_t = 120)]
    pub inference_timeout_secs: u64,

    /// How long a request waits for its model to load, in seconds
    #[arg(long, env = "BGREMOVE_LOAD_TIMEOUT_SECS", default_value_t = 600)]
    pub load_timeout_secs: u64,

    /// How long an unload waits for in-flight requests, in seconds
    #[arg(long, env = "BGREMOVE_UNLOAD_TIMEOUT_SECS", default_value_t = 30)]
    pub unload_timeout_secs: u64,

    /// Unload models idle for this many seconds (disabled when unset)
    #[arg(long, env = "BGREMOVE_IDLE_TTL_SECS")]
    pub idle_ttl_secs: Option<u64>,

    /// Weight cache directory
    #[arg(long, env = "BGREMOVE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Largest accepted upload in bytes
    #[arg(long, env = "BGREMOVE_MAX_IMAGE_BYTES")]
    pub max_image_bytes: Option<usize>,

    /// Number of intra-op threads (0 = auto)
    #[arg(short, long, env = "BGREMOVE_THREADS", default_value_t = 0)]
    pub threads: usize,

    /// Models to load before accepting traffic (comma separated)
    #[arg(long, env = "BGREMOVE_PRELOAD", value_delimiter = ',')]
    pub preload: Vec<String>,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE, -vvv: TRACE for dependencies too)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format: console, compact or json
    #[arg(long, env = "BGREMOVE_LOG_FORMAT", default_value = "console")]
    pub log_format: String,

    /// Show execution provider diagnostics and exit
    #[arg(long)]
    pub show_providers: bool,

    /// List cached model weights and exit
    #[arg(long)]
    pub list_cache: bool,

    /// Remove a model's cached weights and exit
    #[arg(long, value_name = "MODEL")]
    pub clear_cache: Option<String>,
}

/// Parse arguments and run the server
pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    CliConfigBuilder::tracing_from_cli(&cli)?.init()?;

    if cli.show_providers {
        show_providers();
        return Ok(());
    }
    if cli.list_cache || cli.clear_cache.is_some() {
        return manage_cache(&cli);
    }

    let config = CliConfigBuilder::from_cli(&cli)?;
    let service = Arc::new(
        InferenceDispatchService::from_config(config)
            .context("Failed to build inference service")?,
    );

    for model in &cli.preload {
        info!(model = %model, "preloading model");
        service
            .load_model(model)
            .await
            .with_context(|| format!("Failed to preload model '{model}'"))?;
    }

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;
    info!(address = %cli.bind, "listening");

    axum::serve(listener, server::router(Arc::clone(&service)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    service.shutdown().await;
    info!("server stopped");
    Ok(())
}

fn show_providers() {
    println!("Execution providers:");
    #[cfg(feature = "onnx")]
    for (name, available, description) in crate::backends::OnnxBackend::list_providers() {
        let mark = if available { "yes" } else { "no" };
        println!("  {name:<8} {mark:<4} {description}");
    }
    #[cfg(not(feature = "onnx"))]
    println!("  ONNX backend not compiled in");
}

fn manage_cache(cli: &Cli) -> Result<()> {
    let cache = match &cli.cache_dir {
        Some(dir) => ModelCache::with_cache_dir(dir)?,
        None => ModelCache::new()?,
    };

    if let Some(model) = &cli.clear_cache {
        if cache.clear_model(model)? {
            println!("Removed cached weights for '{model}'");
        } else {
            println!("No cached weights for '{model}'");
        }
        return Ok(());
    }

    let models = cache.scan()?;
    println!("Cache directory: {}", cache.cache_dir().display());
    if models.is_empty() {
        println!("No cached models");
    }
    for model in models {
        let precisions: Vec<&str> = model.precisions.iter().map(|p| p.as_str()).collect();
        println!(
            "  {:<12} {:>10}  {}",
            model.model_id,
            format_size(model.size_bytes),
            precisions.join(", ")
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
