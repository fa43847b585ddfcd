//! # Index Mirror CLI (`idxm`)
//!
//! The `idxm` binary drives the index mirror: schema initialization,
//! appending activities to the primary store, full backfill of the
//! index, and filtered searches against it.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `idxm init` | Create the SQLite database and run schema migrations |
//! | `idxm log <type>` | Append an activity and index it inline |
//! | `idxm backfill <entity>` | Re-materialize all records of a kind into the index |
//! | `idxm search activities` | Filtered activity lookup |
//! | `idxm search rules` | Filtered active-rule lookup |
//! | `idxm status` | Row and document counts per entity kind |
//!
//! ## Examples
//!
//! ```bash
//! idxm init --config ./config/idxm.toml
//! idxm log QPROFILE --detail profileKey=P1 --message "rule activated"
//! idxm backfill activities
//! idxm search activities --type QPROFILE --since 2024-01-01
//! idxm search rules --profile P1 --severity BLOCKER --severity CRITICAL
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use index_mirror::config::{self, Config};
use index_mirror::db;
use index_mirror::migrate;
use index_mirror::models::{DocKind, Inheritance, Severity};
use index_mirror::query::{
    ActiveRuleQuery, ActivityQuery, SearchOptions, SortField, SortOrder,
};
use index_mirror::results;
use index_mirror::source;
use index_mirror::store::sqlite::SqliteIndexStore;
use index_mirror::store::IndexStore;
use index_mirror::sync::{ChangeEvent, ChangeOp, Synchronizer};

/// Index Mirror CLI — keeps a queryable document index in sync with a
/// relational system of record.
#[derive(Parser)]
#[command(
    name = "idxm",
    about = "Index Mirror — a secondary search index over a relational system of record",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/idxm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, the relational tables and the
    /// index table. Idempotent.
    Init,

    /// Append an activity to the primary store and index it inline.
    Log {
        /// Activity type tag (e.g. `QPROFILE`, `ANALYSIS_REPORT`).
        activity_type: String,

        /// Free-form message stored with the activity.
        #[arg(long)]
        message: Option<String>,

        /// Login of the author.
        #[arg(long)]
        login: Option<String>,

        /// Detail attribute as `key=value`; repeatable.
        #[arg(long = "detail", value_parser = parse_key_val)]
        details: Vec<(String, String)>,
    },

    /// Re-materialize all primary-store records of a kind into the index.
    ///
    /// Repairs drift between the relational tables and the index.
    /// Individual malformed records are skipped and reported at the end;
    /// Ctrl-C cancels at the next chunk boundary.
    Backfill {
        /// Entity kind: `activities`, `active-rules`, or `all`.
        entity: String,

        /// Documents per bulk-upsert chunk (defaults to `sync.chunk_size`).
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Search the index.
    Search {
        #[command(subcommand)]
        target: SearchTarget,
    },

    /// Show row and document counts per entity kind.
    Status,
}

/// Search subcommands per document kind.
#[derive(Subcommand)]
enum SearchTarget {
    /// Filtered activity lookup.
    Activities {
        /// Match any of these activity types; repeatable.
        #[arg(long = "type")]
        types: Vec<String>,

        /// Detail filter as `key=value`; repeatable. Values for the same
        /// key are alternatives; distinct keys must all match.
        #[arg(long = "detail", value_parser = parse_key_val)]
        details: Vec<(String, String)>,

        /// Match any of these project keys; repeatable.
        #[arg(long = "project")]
        projects: Vec<String>,

        /// Only activities created strictly after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only activities created strictly before this date (YYYY-MM-DD).
        #[arg(long)]
        to: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Page size; 0 uses the default.
        #[arg(long, default_value_t = 0)]
        limit: i64,

        /// Sort field: `created_at` or `key`.
        #[arg(long, default_value = "created_at")]
        sort: String,

        /// Sort ascending instead of descending.
        #[arg(long)]
        asc: bool,
    },

    /// Filtered active-rule lookup.
    Rules {
        /// Scope to one quality profile.
        #[arg(long)]
        profile: Option<String>,

        /// Scope to one rule key.
        #[arg(long)]
        rule: Option<String>,

        /// Match any of these severities; repeatable.
        #[arg(long = "severity")]
        severities: Vec<String>,

        /// Match any of these inheritance modes; repeatable.
        #[arg(long = "inheritance")]
        inheritances: Vec<String>,

        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Page size; 0 uses the default.
        #[arg(long, default_value_t = 0)]
        limit: i64,
    },
}

/// Parse a `key=value` pair for `--detail` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = match cli.command {
        Commands::Init => {
            config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal())
        }
        _ => config::load_config(&cli.config)?,
    };

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Log {
            activity_type,
            message,
            login,
            details,
        } => {
            run_log(&cfg, &activity_type, message, login, details).await?;
        }
        Commands::Backfill { entity, chunk_size } => {
            run_backfill(&cfg, &entity, chunk_size).await?;
        }
        Commands::Search { target } => match target {
            SearchTarget::Activities {
                types,
                details,
                projects,
                since,
                to,
                offset,
                limit,
                sort,
                asc,
            } => {
                run_search_activities(
                    &cfg, types, details, projects, since, to, offset, limit, sort, asc,
                )
                .await?;
            }
            SearchTarget::Rules {
                profile,
                rule,
                severities,
                inheritances,
                offset,
                limit,
            } => {
                run_search_rules(&cfg, profile, rule, severities, inheritances, offset, limit)
                    .await?;
            }
        },
        Commands::Status => {
            run_status(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_log(
    cfg: &Config,
    activity_type: &str,
    message: Option<String>,
    login: Option<String>,
    details: Vec<(String, String)>,
) -> Result<()> {
    let pool = db::connect(&cfg.db.path).await?;

    let id = uuid::Uuid::new_v4().to_string();
    let details: BTreeMap<String, String> = details.into_iter().collect();
    let record = source::insert_activity(
        &pool,
        &id,
        activity_type,
        Utc::now(),
        login.as_deref(),
        message.as_deref(),
        &details,
    )
    .await?;

    let sync = Synchronizer::new(Arc::new(SqliteIndexStore::new(pool.clone())));
    sync.apply(&ChangeEvent {
        kind: DocKind::Activity,
        key: id.clone(),
        op: ChangeOp::Upsert(record),
    })
    .await?;

    println!("logged activity {id}");
    pool.close().await;
    Ok(())
}

async fn run_backfill(cfg: &Config, entity: &str, chunk_size: Option<usize>) -> Result<()> {
    let kinds: Vec<DocKind> = match entity {
        "activities" => vec![DocKind::Activity],
        "active-rules" => vec![DocKind::ActiveRule],
        "all" => vec![DocKind::Activity, DocKind::ActiveRule],
        _ => bail!("Unknown entity: '{entity}'. Use activities, active-rules, or all."),
    };
    let chunk_size = chunk_size.unwrap_or(cfg.sync.chunk_size);

    let pool = db::connect(&cfg.db.path).await?;
    let sync = Synchronizer::new(Arc::new(SqliteIndexStore::new(pool.clone())));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    for kind in kinds {
        let records = match kind {
            DocKind::Activity => source::fetch_activities(&pool).await?,
            DocKind::ActiveRule => source::fetch_active_rules(&pool).await?,
        };
        let fetched = records.len();
        let report = sync.backfill(kind, records, chunk_size, &cancel).await;

        println!("backfill {}", kind.tag());
        println!("  fetched: {fetched} records");
        println!("  indexed: {} documents", report.indexed);
        println!("  chunks committed: {}", report.chunks_committed);
        if !report.failed.is_empty() {
            println!("  failed: {}", report.failed.len());
            for (key, reason) in &report.failed {
                println!("    {key}: {reason}");
            }
        }
        if report.cancelled {
            println!("  cancelled before completion");
            break;
        }
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_search_activities(
    cfg: &Config,
    types: Vec<String>,
    details: Vec<(String, String)>,
    projects: Vec<String>,
    since: Option<String>,
    to: Option<String>,
    offset: i64,
    limit: i64,
    sort: String,
    asc: bool,
) -> Result<()> {
    let mut query = ActivityQuery::new();
    query.types = types;
    for (key, value) in details {
        query = query.with_detail(key, value);
    }
    for project in projects {
        query = query.for_project(project);
    }
    if let Some(ref s) = since {
        query = query.since(parse_date(s)?);
    }
    if let Some(ref s) = to {
        query = query.to(parse_date(s)?);
    }

    let options = SearchOptions {
        offset,
        limit: if limit == 0 { cfg.search.default_limit } else { limit },
        sort: SortField::parse(&sort)?,
        order: if asc { SortOrder::Asc } else { SortOrder::Desc },
    };
    options.validate()?;

    let pool = db::connect(&cfg.db.path).await?;
    let store = SqliteIndexStore::new(pool.clone());
    let page = store.search(&query.to_filter(), &options).await?;
    let result = results::map_activities(page, &options);

    if result.hits.is_empty() {
        println!("No results.");
    }
    for (i, activity) in result.hits.iter().enumerate() {
        println!(
            "{}. [{}] {}",
            options.offset + i as i64 + 1,
            activity.activity_type,
            activity.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(ref login) = activity.login {
            println!("    by: {login}");
        }
        if let Some(ref message) = activity.message {
            println!("    message: {message}");
        }
        println!("    id: {}", activity.key);
    }
    print_footer(result.total, result.skipped);

    pool.close().await;
    Ok(())
}

async fn run_search_rules(
    cfg: &Config,
    profile: Option<String>,
    rule: Option<String>,
    severities: Vec<String>,
    inheritances: Vec<String>,
    offset: i64,
    limit: i64,
) -> Result<()> {
    let mut query = ActiveRuleQuery::new();
    query.profile_key = profile;
    query.rule_key = rule;
    for s in &severities {
        query = query.with_severity(Severity::parse(s)?);
    }
    for s in &inheritances {
        query = query.with_inheritance(Inheritance::parse(s)?);
    }

    let options = SearchOptions::page(
        offset,
        if limit == 0 { cfg.search.default_limit } else { limit },
    );
    options.validate()?;

    let pool = db::connect(&cfg.db.path).await?;
    let store = SqliteIndexStore::new(pool.clone());
    let page = store.search(&query.to_filter(), &options).await?;
    let result = results::map_active_rules(page, &options);

    if result.hits.is_empty() {
        println!("No results.");
    }
    for (i, active_rule) in result.hits.iter().enumerate() {
        println!(
            "{}. {} on {} [{} {}]",
            options.offset + i as i64 + 1,
            active_rule.rule_key,
            active_rule.profile_key,
            active_rule.severity.as_str(),
            active_rule.inheritance.as_str()
        );
        for (name, value) in &active_rule.params {
            println!("    {name} = {value}");
        }
    }
    print_footer(result.total, result.skipped);

    pool.close().await;
    Ok(())
}

fn print_footer(total: i64, skipped: u64) {
    println!("total: {total}");
    if skipped > 0 {
        println!("skipped malformed hits: {skipped}");
    }
}

async fn run_status(cfg: &Config) -> Result<()> {
    let pool = db::connect(&cfg.db.path).await?;

    let activities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activities")
        .fetch_one(&pool)
        .await?;
    let rules: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM active_rules")
        .fetch_one(&pool)
        .await?;

    println!("primary store");
    println!("  activities: {activities}");
    println!("  active rules: {rules}");

    println!("index");
    for kind in [DocKind::Activity, DocKind::ActiveRule] {
        let docs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM index_documents WHERE kind = ?")
                .bind(kind.tag())
                .fetch_one(&pool)
                .await?;
        let rows = match kind {
            DocKind::Activity => activities,
            DocKind::ActiveRule => rules,
        };
        let drift = if docs == rows { "" } else { "  (drift — run backfill)" };
        println!("  {}: {docs} documents{drift}", kind.tag());
    }

    pool.close().await;
    Ok(())
}
