use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod catalog;
mod cli;
mod config;
mod factory;
mod images;
mod similarity;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use catalog::{CatalogItemCreate, JsonCatalog};
use factory::{App, AppFactory};
use similarity::{FindSimilarParams, QuerySource};
use storage::LocalBlobStore;

pub fn parse_tags(tags: String) -> Vec<String> {
    tags.split(',')
        .flat_map(|value| value.split(' ').filter(|value| !value.is_empty()))
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::Args::parse();
    let paths = AppFactory::get_paths()?;

    // commands that only need the catalog or the uploads directory skip
    // model loading
    match args.command {
        cli::Command::Categories {} => print_categories(&AppFactory::open_catalog(&paths)?),
        cli::Command::CleanupUploads { older_than_hours } => {
            cleanup_uploads(&*AppFactory::uploads_store(&paths)?, older_than_hours)
        }

        command => run(command, AppFactory::create_app(&paths, args.tier)?),
    }
}

fn run(command: cli::Command, mut app: App) -> anyhow::Result<()> {
    match command {
        cli::Command::Serve { host, port } => {
            if let Some(host) = host {
                app.config.server.host = host;
            }
            if let Some(port) = port {
                app.config.server.port = port;
            }
            web::start_daemon(app)
        }

        cli::Command::Search {
            image,
            min_similarity,
            max_results,
            category,
        } => {
            let source = if image.starts_with("http://") || image.starts_with("https://") {
                QuerySource::Url(image)
            } else {
                QuerySource::Path(PathBuf::from(image))
            };

            let defaults = &app.config.similarity;
            let params = FindSimilarParams {
                min_similarity: min_similarity.unwrap_or(defaults.default_min_similarity),
                max_results: max_results.unwrap_or(defaults.default_max_results),
                category_filter: category,
            };

            let response = app.engine.find_similar(&source, &params)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        cli::Command::Add {
            name,
            category,
            image_url,
            description,
            price,
            brand,
            tags,
        } => {
            let item = CatalogItemCreate {
                name,
                category,
                image_url,
                description,
                price,
                brand,
                tags: tags.map(parse_tags).unwrap_or_default(),
                ..Default::default()
            }
            .into_item()?;

            let product = app.catalog.add_item(item)?;
            match app.engine.add_product_to_index(&product) {
                Ok(Some(row)) => log::info!("indexed at row {row}"),
                Ok(None) => log::info!("tier '{}' keeps no index", app.engine.tier()),
                Err(e) => log::warn!("product added but not indexed: {e}"),
            }

            println!(
                "{}",
                serde_json::to_string_pretty(&product.without_embedding())?
            );
            Ok(())
        }

        cli::Command::Rebuild {} => {
            let count = app
                .engine
                .rebuild_index()
                .context("Failed to rebuild index")?;
            println!("{count} items indexed");
            Ok(())
        }

        cli::Command::Status {} => {
            let status = app.engine.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            println!("{} products in catalog", app.catalog.len());
            Ok(())
        }

        cli::Command::Categories {} => print_categories(&app.catalog),
        cli::Command::CleanupUploads { older_than_hours } => {
            cleanup_uploads(&app.uploads, older_than_hours)
        }
    }
}

fn print_categories(catalog: &JsonCatalog) -> anyhow::Result<()> {
    for category in catalog.categories()? {
        println!("{category}");
    }
    Ok(())
}

fn cleanup_uploads(uploads: &LocalBlobStore, older_than_hours: u64) -> anyhow::Result<()> {
    let removed = uploads
        .prune_older_than(Duration::from_secs(older_than_hours.saturating_mul(3600)))
        .context("Failed to clean up uploads")?;
    println!("{removed} files removed");
    Ok(())
}
