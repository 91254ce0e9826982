//! Application state for the laudo API

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::config::Args;
use crate::files::UploadStore;

pub struct AppState {
    pub db: SqlitePool,
    pub uploads: UploadStore,
}

impl AppState {
    pub async fn new(args: &Args) -> Result<Self> {
        std::fs::create_dir_all(&args.data_dir).with_context(|| {
            format!("Failed to create data dir: {}", args.data_dir.display())
        })?;

        let db_url = args.database_url();
        tracing::info!("Connecting to database: {}", db_url);
        let pool = connect(&db_url).await?;

        Self::from_pool(pool, args.data_dir.clone()).await
    }

    /// Wrap an open pool, creating the schema if needed
    pub async fn from_pool(pool: SqlitePool, data_dir: PathBuf) -> Result<Self> {
        run_migrations(&pool).await?;
        Ok(Self {
            db: pool,
            uploads: UploadStore::new(data_dir),
        })
    }
}

/// Open the database with a single connection.
///
/// Every write goes through that one connection, which serialises
/// transactions (control-number allocation relies on this). The connection is
/// never recycled so `sqlite::memory:` keeps its contents.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database URL: {}", url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    tracing::info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS avaliacoes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            controle TEXT UNIQUE NOT NULL,
            ano INTEGER NOT NULL,
            dados_json TEXT NOT NULL,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_avaliacoes_updated
        AFTER UPDATE ON avaliacoes
        FOR EACH ROW
        BEGIN
            UPDATE avaliacoes SET updated_at = CURRENT_TIMESTAMP WHERE id = OLD.id;
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS areas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            avaliacao_id INTEGER NOT NULL,
            descricao TEXT,
            largura REAL,
            comprimento REAL,
            area REAL,
            tipo TEXT,
            FOREIGN KEY(avaliacao_id) REFERENCES avaliacoes(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comparativos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            avaliacao_id INTEGER NOT NULL,
            endereco TEXT,
            valor REAL,
            area REAL,
            link TEXT,
            latitude REAL,
            longitude REAL,
            observacoes TEXT,
            FOREIGN KEY(avaliacao_id) REFERENCES avaliacoes(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fotos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            avaliacao_id INTEGER NOT NULL,
            legenda TEXT,
            caminho TEXT NOT NULL,
            ordem INTEGER DEFAULT 0,
            FOREIGN KEY(avaliacao_id) REFERENCES avaliacoes(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documentos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            avaliacao_id INTEGER NOT NULL,
            tipo TEXT,
            nome_original TEXT,
            caminho TEXT NOT NULL,
            FOREIGN KEY(avaliacao_id) REFERENCES avaliacoes(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Last issued sequence per year
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequencias_controle (
            ano INTEGER PRIMARY KEY,
            ultima INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (table, index) in [
        ("areas", "idx_areas_avaliacao"),
        ("comparativos", "idx_comparativos_avaliacao"),
        ("fotos", "idx_fotos_avaliacao"),
        ("documentos", "idx_documentos_avaliacao"),
    ] {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}(avaliacao_id)",
            index, table
        ))
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_avaliacoes_ano ON avaliacoes(ano)")
        .execute(pool)
        .await?;

    tracing::info!("Migrations complete");
    Ok(())
}
