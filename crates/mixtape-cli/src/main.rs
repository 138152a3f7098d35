use anyhow::Result;
use clap::{Parser, Subcommand};
use mixtape_browse::{
    distinct_artists, filter_by_tempo, load_tracks_by_genre, sort_rows, SortMode, TempoFilter,
    DEFAULT_PAGE_SIZE,
};
use mixtape_sync::{SqliteSink, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mixtape-cli")]
#[command(about = "Mixtape catalog harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest the enabled categories into the relational store.
    Sync,
    /// Create the relational tables.
    Migrate,
    /// List stored tracks for a genre.
    Browse {
        #[arg(long)]
        genre: String,
        #[arg(long, default_value = "random")]
        sort: String,
        #[arg(long, default_value = "any")]
        tempo: TempoFilter,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let outcome = mixtape_sync::run_sync_once_from_env().await?;
            let summary = &outcome.summary;
            println!(
                "sync complete: run_id={} tracks={} artists={} features={} skipped={} cache_hits={} network_calls={} report={}",
                summary.run_id,
                summary.persisted_tracks,
                summary.persisted_artists,
                summary.persisted_features,
                summary.skipped_records,
                summary.cache_hits,
                summary.network_calls,
                outcome.report_path.display()
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let sink = SqliteSink::connect(&config.database_url).await?;
            sink.migrate().await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Browse {
            genre,
            sort,
            tempo,
            limit,
        } => {
            let config = SyncConfig::from_env()?;
            let sink = SqliteSink::connect(&config.database_url).await?;
            let mode = sort.parse::<SortMode>()?;

            let mut rows = filter_by_tempo(load_tracks_by_genre(sink.pool(), &genre).await?, tempo);
            sort_rows(&mut rows, mode, &mut rand::thread_rng());
            rows.truncate(limit);

            for row in &rows {
                println!(
                    "{} | {} | {} | popularity={} tempo={:.1} danceability={:.2} | {}",
                    row.track_name,
                    row.artist_name,
                    row.album_name,
                    row.popularity,
                    row.tempo,
                    row.danceability,
                    row.spotify_url
                );
            }
            println!(
                "{} tracks by {} artists ({genre}, {mode})",
                rows.len(),
                distinct_artists(&rows).len()
            );
        }
    }

    Ok(())
}
