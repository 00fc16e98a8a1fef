use docsplit::db::Db;
use docsplit::error::DocsplitError;
use docsplit::janitor::JanitorService;
use docsplit::process::build_converter;
use docsplit::{Config, Pipeline};
use std::path::Path;
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.docsplit.log_level.as_str())
    ).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("verify");

    match command {
        "janitor" => run_janitor(config).await?,
        "sweep" => run_single_sweep(config).await?,
        _ => run_schema_verification(config).await?,
    }

    Ok(())
}

async fn open_database(config: &Config) -> Result<Db> {
    let db = Db::new(config.db_path());
    let applied = db.migrate(Path::new("migrations")).await?;
    if applied > 0 {
        log::info!("Applied {} migrations", applied);
    }
    Ok(db)
}

/// Sweep expired working areas on an interval until Ctrl+C
async fn run_janitor(config: Config) -> Result<()> {
    log::info!("Starting docsplit janitor v{}", env!("CARGO_PKG_VERSION"));
    let db = open_database(&config).await?;
    let interval = config.janitor.sweep_interval();
    let converter = build_converter(&config)?;
    let pipeline = Pipeline::new(config, db, converter);

    let service = JanitorService::start(pipeline.janitor(), interval);
    log::info!("Janitor running (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await?;
    service.stop().await?;
    Ok(())
}

async fn run_single_sweep(config: Config) -> Result<()> {
    let db = open_database(&config).await?;
    let converter = build_converter(&config)?;
    let pipeline = Pipeline::new(config, db, converter);

    let report = pipeline.janitor().sweep().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run database schema verification
async fn run_schema_verification(config: Config) -> Result<()> {
    log::info!("Starting docsplit v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Upload folder: {}", config.upload_folder().display());
    log::info!("Database path: {}", config.db_path().display());
    log::info!(
        "Split thresholds: {} bytes, {} pages, {} chars",
        config.splitting.max_file_size_bytes,
        config.splitting.page_chunk_size,
        config.splitting.char_chunk_size
    );

    let db = open_database(&config).await?;
    verify_database_schema(&db).await?;

    log::info!("Database schema verified");
    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = ["document_parts", "documents", "schema_migrations", "working_areas"];
        let mut all_tables_exist = true;

        for table in &expected_tables {
            if !tables.iter().any(|t| t == table) {
                log::error!("Missing table: {}", table);
                all_tables_exist = false;
            } else {
                log::debug!("✓ Table exists: {}", table);
            }
        }

        if !all_tables_exist {
            return Err(DocsplitError::Config("Not all required tables exist".to_string()));
        }

        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")?;
        let indexes: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        log::debug!("{} indexes present", indexes.len());

        Ok(())
    }).await?;

    Ok(())
}
