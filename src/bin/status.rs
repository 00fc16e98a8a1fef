use clap::{Parser, Subcommand};
use docsplit::db::Db;
use docsplit::process::build_converter;
use docsplit::store::documents;
use docsplit::{Config, Pipeline};
use std::path::Path;
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "status")]
#[command(about = "Inspect documents and clean up their working areas")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a document and its parts as JSON
    Show { document_id: String },
    /// List the most recently updated documents
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete a document's working areas now (or expire them if work is in flight)
    Cleanup { document_id: String },
    /// Delete a document, its parts and its working areas
    Delete { document_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    let config = Config::load()?;
    let db = Db::new(config.db_path());
    db.migrate(Path::new("migrations")).await?;

    match args.command {
        Command::List { limit } => {
            let docs = db.with_connection(move |conn| documents::list_recent(conn, limit)).await?;
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                let parts = doc.total_parts.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\tparts={}\t{}",
                    doc.id,
                    doc.status,
                    doc.format_class,
                    parts,
                    doc.original_filename
                );
            }
        }
        command => {
            let converter = build_converter(&config)?;
            let pipeline = Pipeline::new(config, db, converter);
            match command {
                Command::Show { document_id } => {
                    let report = pipeline.document_status(&document_id).await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Command::Cleanup { document_id } => {
                    let outcome = pipeline.force_cleanup(&document_id).await?;
                    println!("{}", serde_json::to_string(&outcome)?);
                }
                Command::Delete { document_id } => {
                    let outcome = pipeline.delete_document(&document_id).await?;
                    println!("{}", serde_json::to_string(&outcome)?);
                }
                Command::List { .. } => {}
            }
        }
    }

    Ok(())
}
