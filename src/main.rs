//! hubwarden CLI entry point

use clap::{Parser, Subcommand};
use hubwarden::{
    commands::{
        cmd_init, cmd_search, print_alerts, print_init_report, print_priority_resources,
        print_query_results, print_similar, print_stats, print_tasks, InitOptions, SearchOptions,
    },
    config::Config,
    error::{Error, Result},
    knowledge::SearchMode,
    models::ResourceType,
    service::HubService,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hubwarden")]
#[command(version, about = "Always-on crawler, search index and watchlist for an AI artifact registry", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "HUBWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the database
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the agent: scheduled crawls, reindexing, alerts and supervision
    Run {
        /// Seconds running tasks get to finish on shutdown
        #[arg(long, default_value = "30")]
        grace_secs: u64,
    },

    /// Crawl the registry once in the foreground
    Crawl {
        /// Resource type (model, dataset, space, paper); defaults to all configured
        #[arg(short = 't', long = "type")]
        resource_type: Option<ResourceType>,

        /// Maximum items per resource type
        #[arg(short, long)]
        limit: Option<usize>,

        /// Queue the crawl for a running agent instead of crawling here
        #[arg(long)]
        queue: bool,
    },

    /// Rebuild the vector index from stored embeddings
    Reindex {
        /// Queue the rebuild for a running agent instead of rebuilding here
        #[arg(long)]
        queue: bool,
    },

    /// Search stored resources
    Search {
        /// The search query
        query: String,

        #[arg(short = 't', long = "type")]
        resource_type: Option<ResourceType>,

        /// lexical, semantic or hybrid
        #[arg(short, long, default_value = "hybrid")]
        mode: SearchMode,

        /// Maximum number of results (0 for the configured default)
        #[arg(short, long, default_value = "0")]
        limit: usize,
    },

    /// Resources whose embeddings are closest to a stored resource
    Similar {
        /// Resource id, e.g. org/model
        id: String,

        #[arg(short = 't', long = "type", default_value = "model")]
        resource_type: ResourceType,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Stored resources matching the watch rules
    Watched {
        #[arg(short, long, default_value = "25")]
        limit: usize,
    },

    /// Record counts, crawl history, index freshness and queue state
    Stats,

    /// List recent tasks, or show one
    Tasks {
        /// Show a single task
        task_id: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Cancel the given task
        #[arg(long, requires = "task_id")]
        cancel: bool,
    },

    /// Write every stored resource to a JSON file
    Export {
        /// Output path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "hubwarden=debug" } else { "hubwarden=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    // Init doesn't need an existing config
    if let Commands::Init { force } = cli.command {
        let (base_dir, config_path) = init_paths(cli.config);
        let report = cmd_init(InitOptions {
            base_dir,
            config_path,
            force,
        })
        .await?;
        return if cli.json {
            print_json(&report)
        } else {
            print_init_report(&report);
            Ok(())
        };
    }

    let config = load_config(cli.config.as_deref())?;
    let service = HubService::open(config).await?;

    match cli.command {
        Commands::Init { .. } => {}

        Commands::Run { grace_secs } => {
            let report = service.start().await?;
            if report.failed_tasks > 0 {
                warn!(
                    failed_tasks = report.failed_tasks,
                    "Tasks interrupted by the previous shutdown were marked failed"
                );
            }
            info!("hubwarden running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            service.shutdown(Duration::from_secs(grace_secs)).await;
        }

        Commands::Crawl {
            resource_type,
            limit,
            queue,
        } => {
            if queue {
                let task_id = service.trigger_crawl(resource_type, limit).await?;
                if cli.json {
                    print_json(&serde_json::json!({ "task_id": task_id }))?;
                } else {
                    println!("Queued crawl task {}", task_id);
                }
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping at the next item");
                    on_interrupt.cancel();
                }
            });

            let outcome = service.crawl_now(resource_type, limit, &cancel).await;
            service.evaluate_pending().await;
            let alerts = service.get_priority_matches(None).await;
            let stats = service.get_stats().await?;
            if cli.json {
                print_json(&serde_json::json!({
                    "cycles": stats.last_cycle_per_type,
                    "alerts": alerts,
                }))?;
            } else {
                print_stats(&stats);
                println!("\nAlerts from this crawl:");
                print_alerts(&alerts);
            }
            match outcome {
                Err(Error::Cancelled) => warn!("Crawl cancelled"),
                other => other?,
            }
        }

        Commands::Reindex { queue: true } => {
            let task_id = service.trigger_reindex().await?;
            if cli.json {
                print_json(&serde_json::json!({ "task_id": task_id }))?;
            } else {
                println!("Queued reindex task {}", task_id);
            }
        }

        Commands::Reindex { queue: false } => {
            let report = service.reindex_now().await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "Rebuilt index generation {} with {} vectors ({} records embedded first)",
                    report.generation, report.entries, report.embedded
                );
            }
        }

        Commands::Search {
            query,
            resource_type,
            mode,
            limit,
        } => {
            let options = SearchOptions {
                resource_type,
                mode,
                limit,
            };
            let result = cmd_search(&service, &query, options).await?;
            if cli.json {
                print_json(&result)?;
            } else {
                print_query_results(&result);
            }
        }

        Commands::Similar {
            id,
            resource_type,
            limit,
        } => {
            let hits = service.get_similar(&id, resource_type, limit).await?;
            if cli.json {
                print_json(&hits)?;
            } else {
                print_similar(&id, &hits);
            }
        }

        Commands::Watched { limit } => {
            let records = service.get_priority_resources(limit).await?;
            if cli.json {
                print_json(&records)?;
            } else {
                print_priority_resources(&records);
            }
        }

        Commands::Stats => {
            let stats = service.get_stats().await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                print_stats(&stats);
            }
        }

        Commands::Tasks {
            task_id,
            limit,
            cancel,
        } => match task_id {
            Some(id) if cancel => {
                let cancelled = service.cancel_task(&id).await?;
                if cli.json {
                    print_json(&serde_json::json!({ "task_id": id, "cancelled": cancelled }))?;
                } else if cancelled {
                    println!("Cancelled task {}", id);
                } else {
                    println!("Task {} is not queued in this process's view; nothing cancelled", id);
                }
            }
            Some(id) => {
                let task = service.get_task_status(&id).await?;
                if cli.json {
                    print_json(&task)?;
                } else {
                    print_tasks(std::slice::from_ref(&task));
                }
            }
            None => {
                let tasks = service.list_tasks(limit).await?;
                let counts = service.queue_stats().await?;
                if cli.json {
                    print_json(&serde_json::json!({ "counts": counts, "tasks": tasks }))?;
                } else {
                    println!(
                        "{} queued, {} running, {} succeeded, {} failed, {} cancelled\n",
                        counts.queued, counts.running, counts.succeeded, counts.failed, counts.cancelled
                    );
                    print_tasks(&tasks);
                }
            }
        },

        Commands::Export { path } => {
            let count = service.export_knowledge(&path).await?;
            if cli.json {
                print_json(&serde_json::json!({ "path": path, "records": count }))?;
            } else {
                println!("Exported {} resources to {}", count, path.display());
            }
        }
    }

    Ok(())
}

/// Base directory and config path for `init`; a `.toml` path names the file,
/// anything else names the directory
fn init_paths(config: Option<PathBuf>) -> (PathBuf, PathBuf) {
    match config {
        Some(path) if path.extension().is_some_and(|e| e == "toml") => {
            let base = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir);
            (base, path)
        }
        Some(dir) => (dir.clone(), dir.join("config.toml")),
        None => {
            let base = Config::default_base_dir();
            (base.clone(), base.join("config.toml"))
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        return Err(Error::Config(format!(
            "Config file not found: {}. Run 'hubwarden init' first.",
            config_path.display()
        )));
    }

    Config::load(&config_path)
}
