use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use jobdeck_adapters::{HnApiSource, HnSourceConfig};
use jobdeck_core::{AnnotationEdit, ItemKind, Record};
use jobdeck_storage::Store;
use jobdeck_sync::{
    AnnotationEditor, CancelFlag, QueryEngine, QueryPredicate, RefreshScope, SortKey, SyncConfig,
    Synchronizer,
};

#[derive(Debug, Parser)]
#[command(name = "jobdeck")]
#[command(about = "Browse and annotate forum job postings offline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the current job listing, or one full discussion thread.
    Refresh {
        /// Item whose comment tree should be pulled in as well.
        #[arg(long)]
        thread: Option<u64>,
    },
    /// List cached records, filtered and sorted.
    List {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        min_rating: Option<u8>,
        /// Only records that carry a rating.
        #[arg(long)]
        rated: bool,
        /// Case-insensitive substring over title and text.
        #[arg(long)]
        contains: Option<String>,
        #[arg(long, value_enum, default_value_t = SortArg::Recent)]
        sort: SortArg,
        /// List comments instead of top-level jobs.
        #[arg(long)]
        comments: bool,
        #[arg(long)]
        with_tombstones: bool,
        #[arg(long)]
        no_stale: bool,
    },
    /// Print one record in full.
    Show { id: u64 },
    /// Add tags to a record (or remove them with --remove).
    Tag {
        id: u64,
        #[arg(required = true)]
        tags: Vec<String>,
        #[arg(long)]
        remove: bool,
    },
    /// Set the 0-5 rating on a record, or clear it.
    Rate {
        id: u64,
        rating: Option<u8>,
        #[arg(long, conflicts_with = "rating")]
        clear: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    Recent,
    Rating,
    Title,
}

impl From<SortArg> for SortKey {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Recent => SortKey::Recency,
            SortArg::Rating => SortKey::Rating,
            SortArg::Title => SortKey::Title,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let mut store = Store::load(config.store_path.clone()).await?;

    match cli.command {
        Commands::Refresh { thread } => {
            let cancel = CancelFlag::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                });
            }

            let source = Arc::new(HnApiSource::new(HnSourceConfig {
                base_url: config.api_base_url.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            })?);
            let sync = Synchronizer::new(source, config.options);
            let scope = match thread {
                Some(id) => RefreshScope::JobPlusThread(id),
                None => RefreshScope::JobsOnly,
            };

            let outcome = sync.refresh(&mut store, scope, &cancel).await?;
            println!(
                "refresh {}: {} merged, {} failed{}",
                outcome.run_id,
                outcome.merged_count(),
                outcome.failed.len(),
                if outcome.cancelled { " (cancelled)" } else { "" }
            );
            if !outcome.failed.is_empty() {
                println!("failed ids: {:?}", outcome.failed);
            }
        }
        Commands::List {
            tag,
            min_rating,
            rated,
            contains,
            sort,
            comments,
            with_tombstones,
            no_stale,
        } => {
            let predicate = QueryPredicate {
                tag,
                min_rating,
                rated_only: rated,
                keyword: contains,
                kind: Some(if comments {
                    ItemKind::Comment
                } else {
                    ItemKind::Job
                }),
                include_tombstones: with_tombstones,
                exclude_stale: no_stale,
            };
            for record in QueryEngine::query(&store, &predicate, sort.into()) {
                println!("{}", summary_line(record));
            }
        }
        Commands::Show { id } => match store.get(id) {
            Some(record) => print_record(record),
            None => bail!("no record for item {id}; refresh first"),
        },
        Commands::Tag { id, tags, remove } => {
            let edit = if remove {
                AnnotationEdit {
                    remove_tags: tags,
                    ..AnnotationEdit::default()
                }
            } else {
                AnnotationEdit {
                    add_tags: tags,
                    ..AnnotationEdit::default()
                }
            };
            let record = AnnotationEditor::apply(&mut store, id, edit).await?;
            println!("{}", summary_line(&record));
        }
        Commands::Rate { id, rating, clear } => {
            let edit = match (rating, clear) {
                (Some(rating), false) => AnnotationEdit::set_rating(rating),
                (None, true) => AnnotationEdit::clear_rating(),
                _ => bail!("provide a rating or --clear"),
            };
            let record = AnnotationEditor::apply(&mut store, id, edit).await?;
            println!("{}", summary_line(&record));
        }
    }

    Ok(())
}

fn summary_line(record: &Record) -> String {
    let rating = record
        .rating()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".to_string());
    let tags = record
        .annotation
        .as_ref()
        .map(|a| a.tags.iter().cloned().collect::<Vec<_>>().join(","))
        .unwrap_or_default();
    let title = record
        .item
        .title
        .clone()
        .unwrap_or_else(|| first_line(&record.item.body_text()));
    format!(
        "{:>9}  [{}] {:<20} {}{}",
        record.item.id,
        rating,
        tags,
        title,
        if record.stale { "  (stale)" } else { "" }
    )
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("(no text)")
        .trim()
        .to_string()
}

fn print_record(record: &Record) {
    if let Some(title) = &record.item.title {
        println!("{title}");
    }
    if let Some(url) = &record.item.url {
        println!("{url}");
    }
    println!(
        "by {} at {}",
        record.item.author.as_deref().unwrap_or("unknown"),
        record.item.created_at
    );
    if let Some(annotation) = &record.annotation {
        let tags = annotation.tags.iter().cloned().collect::<Vec<_>>();
        println!(
            "rating: {}  tags: {}",
            annotation
                .rating
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unrated".to_string()),
            if tags.is_empty() {
                "(none)".to_string()
            } else {
                tags.join(", ")
            }
        );
    }
    println!();
    println!("{}", record.item.body_text());
}
