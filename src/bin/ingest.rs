use clap::Parser;
use docsplit::db::Db;
use docsplit::process::{build_converter, Converter, HttpConverter};
use docsplit::{Config, Pipeline};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Split and convert files, waiting until every document is finalized")]
struct Args {
    /// Files to ingest
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Converter endpoint, overriding [converter] in config.toml
    #[arg(long)]
    endpoint: Option<String>,

    /// Return once parts are queued instead of waiting for results
    #[arg(long)]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();

    log::info!("Starting docsplit ingestion");
    let config = Config::load()?;
    log::info!("Upload folder: {}", config.upload_folder().display());
    log::info!("Database path: {}", config.db_path().display());

    let db = Db::new(config.db_path());
    db.migrate(Path::new("migrations")).await?;

    let converter: Arc<dyn Converter> = match &args.endpoint {
        Some(endpoint) => {
            let api_key_env = config
                .converter
                .as_ref()
                .map(|c| c.api_key_env.clone())
                .unwrap_or_else(|| "DOCSPLIT_CONVERTER_KEY".to_string());
            let api_key = std::env::var(&api_key_env).ok();
            Arc::new(HttpConverter::new(endpoint.clone(), api_key, Duration::from_secs(120))?)
        }
        None => build_converter(&config)?,
    };
    let pipeline = Pipeline::new(config, db, converter);

    let start = Instant::now();
    let mut ingested = Vec::new();
    let mut failed = 0;

    for path in &args.files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        match pipeline.ingest(path, &name).await {
            Ok(ingestion) => {
                if ingestion.split.should_split {
                    log::info!(
                        "{}: split into {} parts ({})",
                        name,
                        ingestion.split.parts.len(),
                        ingestion.split.reason.map(|r| r.as_str()).unwrap_or("-")
                    );
                } else {
                    log::info!("{}: processing whole", name);
                }
                ingested.push((name, ingestion));
            }
            Err(e) => {
                log::error!("{}: {}", name, e);
                failed += 1;
            }
        }
    }

    if args.no_wait {
        log::info!("Queued {} documents in {:?}", ingested.len(), start.elapsed());
        return Ok(());
    }

    for (name, ingestion) in ingested {
        let document_id = ingestion.document_id.clone();
        ingestion.handle.wait().await?;
        let report = pipeline.document_status(&document_id).await?;
        match &report.document.error_message {
            Some(message) => log::warn!("{}: {} ({})", name, report.document.status, message),
            None => log::info!("{}: {}", name, report.document.status),
        }
        println!("{}\t{}\t{}", document_id, report.document.status, name);
    }

    log::info!("Ingestion complete in {:?} ({} failed to start)", start.elapsed(), failed);
    Ok(())
}
