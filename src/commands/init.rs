//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::MetaDb;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub overwrote_config: bool,
}

/// Write a default config and create the metadata database
pub async fn cmd_init(options: InitOptions) -> Result<InitReport> {
    let InitOptions {
        base_dir,
        config_path,
        force,
    } = options;

    let exists = config_path.exists();
    if exists && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    config.init_paths(Some(base_dir));
    config.paths.config_file = config_path;
    config.save()?;

    let db = MetaDb::new(&config.paths.db_file).await?;
    if !db.is_initialized().await? {
        db.init_schema().await?;
    }
    info!(db = ?config.paths.db_file, "Initialized hubwarden");

    Ok(InitReport {
        config_path: config.paths.config_file,
        db_path: config.paths.db_file,
        overwrote_config: exists,
    })
}

pub fn print_init_report(report: &InitReport) {
    println!("Config: {}", report.config_path.display());
    println!("Database: {}", report.db_path.display());
    if report.overwrote_config {
        println!("Existing config was overwritten.");
    }
    println!("\nEdit the config to set watched authors and tags, then run 'hubwarden run'.");
}
