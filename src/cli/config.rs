//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::Cli;
use crate::config::{ExecutionProvider, IdleEvictionConfig, Precision, ServiceConfig};
use crate::tracing_config::{TracingConfig, TracingFormat};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;

/// Convert CLI arguments into service and tracing configuration
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build `ServiceConfig` from CLI arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<ServiceConfig> {
        let provider = Self::parse_provider(&cli.device)?;

        let mut builder = ServiceConfig::builder()
            .execution_provider(provider)
            .gate_capacity(cli.gate_capacity)
            .default_model(cli.default_model.clone())
            .inference_timeout(Duration::from_secs(cli.inference_timeout_secs))
            .load_timeout(Duration::from_secs(cli.load_timeout_secs))
            .unload_timeout(Duration::from_secs(cli.unload_timeout_secs))
            .intra_threads(cli.threads);

        if let Some(precision) = &cli.precision {
            let precision: Precision = precision
                .parse()
                .with_context(|| format!("Invalid precision '{precision}'"))?;
            builder = builder.precision(precision);
        }
        if let Some(ttl) = cli.idle_ttl_secs {
            builder = builder.idle_eviction(IdleEvictionConfig::with_ttl(Duration::from_secs(ttl)));
        }
        if let Some(dir) = &cli.cache_dir {
            builder = builder.cache_dir(dir.clone());
        }
        if let Some(bytes) = cli.max_image_bytes {
            builder = builder.max_image_bytes(bytes);
        }

        builder.build().context("Invalid server configuration")
    }

    /// Build `TracingConfig` from CLI arguments; `RUST_LOG` overrides `-v`
    pub(crate) fn tracing_from_cli(cli: &Cli) -> Result<TracingConfig> {
        let format: TracingFormat = cli.log_format.parse().map_err(|e: String| anyhow!(e))?;
        let mut config = TracingConfig::new()
            .with_verbosity(cli.verbose)
            .with_format(format);
        if let Ok(filter) = std::env::var("RUST_LOG") {
            if !filter.trim().is_empty() {
                config = config.with_env_filter(filter);
            }
        }
        Ok(config)
    }

    fn parse_provider(device: &str) -> Result<ExecutionProvider> {
        match device.to_ascii_lowercase().as_str() {
            "auto" => Ok(ExecutionProvider::Auto),
            "cpu" => Ok(ExecutionProvider::Cpu),
            "cuda" | "gpu" => Ok(ExecutionProvider::Cuda),
            "coreml" => Ok(ExecutionProvider::CoreMl),
            other => Err(anyhow!(
                "Unknown device '{other}' (expected auto, cpu, cuda or coreml)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults_match_service_defaults() {
        let cli = Cli::try_parse_from(["bgremove-server"]).unwrap();
        let config = CliConfigBuilder::from_cli(&cli).unwrap();
        let defaults = ServiceConfig::default();

        assert_eq!(config.gate_capacity, defaults.gate_capacity);
        assert_eq!(config.default_model, defaults.default_model);
        assert_eq!(config.inference_timeout, defaults.inference_timeout);
        assert_eq!(config.load_timeout, defaults.load_timeout);
        assert!(config.idle_eviction.is_none());
        assert!(config.precision.is_none());
    }

    #[test]
    fn test_flags_are_applied() {
        let cli = Cli::try_parse_from([
            "bgremove-server",
            "--device",
            "cpu",
            "--precision",
            "fp16",
            "--gate-capacity",
            "4",
            "--idle-ttl-secs",
            "300",
            "--preload",
            "rmbg2,ben2",
        ])
        .unwrap();
        let config = CliConfigBuilder::from_cli(&cli).unwrap();

        assert_eq!(config.execution_provider, ExecutionProvider::Cpu);
        assert_eq!(config.precision, Some(Precision::Half));
        assert_eq!(config.gate_capacity, 4);
        assert_eq!(
            config.idle_eviction.map(|e| e.idle_ttl),
            Some(Duration::from_secs(300))
        );
        assert_eq!(cli.preload, vec!["rmbg2", "ben2"]);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cli = Cli::try_parse_from(["bgremove-server", "--device", "tpu"]).unwrap();
        assert!(CliConfigBuilder::from_cli(&cli).is_err());

        let cli = Cli::try_parse_from(["bgremove-server", "--gate-capacity", "0"]).unwrap();
        assert!(CliConfigBuilder::from_cli(&cli).is_err());

        let cli = Cli::try_parse_from(["bgremove-server", "--log-format", "xml"]).unwrap();
        assert!(CliConfigBuilder::tracing_from_cli(&cli).is_err());
    }
}
