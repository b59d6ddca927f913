//! Validates a netsmb configuration file and prints the effective settings.

use anyhow::Context;
use netsmb_core::NetsmbConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => {
            let path = PathBuf::from(path);
            tracing::info!("checking {}", path.display());
            NetsmbConfig::from_json_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => {
            tracing::warn!("no config file given, checking defaults");
            let config = NetsmbConfig::default();
            config.validate().context("default configuration invalid")?;
            config
        }
    };

    println!("{}", config.to_json()?);
    tracing::info!(
        "ok: {} handles, multichannel {}",
        config.max_handles,
        if config.multichannel.enabled { "on" } else { "off" }
    );
    Ok(())
}
