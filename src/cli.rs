use clap::{Parser, Subcommand};

use crate::config::TierSetting;

#[derive(Parser, Debug)]
#[command(version, about = "Visual product similarity search", long_about = None)]
pub struct Args {
    /// Override the configured similarity tier
    /// (auto, full, text, keyword, deterministic)
    #[clap(long, global = true)]
    pub tier: Option<TierSetting>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server
    Serve {
        /// Bind address (defaults to server.host from config)
        #[clap(long)]
        host: Option<String>,

        /// Port (defaults to server.port from config)
        #[clap(short, long)]
        port: Option<u16>,
    },

    /// Find catalog items similar to an image file or URL
    Search {
        /// Image path or http(s) URL
        image: String,

        /// Inclusive lower bound on similarity score
        #[clap(long)]
        min_similarity: Option<f32>,

        /// Maximum number of results
        #[clap(short = 'n', long)]
        max_results: Option<usize>,

        /// Only return items in this category (case-insensitive)
        #[clap(short, long)]
        category: Option<String>,
    },

    /// Add a product to the catalog and the index
    Add {
        #[clap(long)]
        name: String,

        #[clap(long)]
        category: String,

        /// Image URL or local path
        #[clap(long)]
        image_url: String,

        #[clap(short, long)]
        description: Option<String>,

        #[clap(long)]
        price: Option<f64>,

        #[clap(long)]
        brand: Option<String>,

        /// Comma separated tags
        #[clap(long)]
        tags: Option<String>,
    },

    /// Recompute every embedding and rewrite the index
    Rebuild {},

    /// Show the active tier and index size
    Status {},

    /// List product categories
    Categories {},

    /// Delete uploaded images and thumbnails older than the given age
    CleanupUploads {
        #[clap(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}
