//! Command-line and environment configuration

use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments for the laudo API server
///
/// Every flag can also be set from the environment (or a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(name = "laudo-api")]
#[command(about = "REST server for appraisal reports")]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Directory holding the database (by default) and the `uploads/` tree.
    /// Stored attachment paths are relative to it.
    #[arg(long, env = "LAUDO_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// SQLite connection URL; defaults to `avaliacoes.db` inside the data dir
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Largest accepted request body, in megabytes
    #[arg(long, env = "LAUDO_MAX_UPLOAD_MB", default_value = "25")]
    pub max_upload_mb: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite:{}?mode=rwc",
                self.data_dir.join("avaliacoes.db").display()
            )
        })
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}
