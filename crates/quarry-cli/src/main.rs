use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use quarry_core::models::{EmploymentType, Job, JobFilters, JobSearchQuery, JobSource, RemoteType};
use quarry_core::{
    JobAggregator, QuarryConfig, RateLimiter, SearchContext, SearchOutcome, SourceOverview,
    SourceStatus, Tracer,
};
use quarry_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "quarry", version, about = "Resilient multi-source job search")]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, global = true, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Caller identity for per-user rate limits
    #[arg(long, global = true, env = "QUARRY_USER_ID")]
    user: Option<String>,

    /// Where rate-limit counters live
    #[arg(
        long,
        global = true,
        value_enum,
        env = "QUARRY_RATE_LIMIT_STORE",
        default_value_t = StoreKind::Memory
    )]
    rate_limit_store: StoreKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every configured source
    Search {
        /// Search keywords
        keywords: Vec<String>,

        #[arg(short, long)]
        location: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        limit: u32,

        /// remote, hybrid or onsite
        #[arg(long)]
        remote: Option<RemoteType>,

        /// full_time, part_time, contract or internship
        #[arg(long)]
        employment: Option<EmploymentType>,

        /// Drop jobs whose advertised salary is below this
        #[arg(long)]
        min_salary: Option<f64>,

        /// Only query these sources (comma separated)
        #[arg(long, value_delimiter = ',')]
        sources: Vec<JobSource>,
    },

    /// Show one listing
    Details {
        source: JobSource,
        external_id: String,
    },

    /// Show circuit and quota state per source
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quarry=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = QuarryConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let ctx = match &cli.user {
        Some(user) => SearchContext::for_user(user.clone()),
        None => SearchContext::anonymous(),
    };

    match cli.command {
        Commands::Search {
            keywords,
            location,
            page,
            limit,
            remote,
            employment,
            min_salary,
            sources,
        } => {
            let aggregator = build_aggregator(&config, cli.rate_limit_store, &sources).await?;
            let mut query = JobSearchQuery::new(keywords.join(" "))
                .with_page(page, limit)
                .with_filters(JobFilters {
                    remote_type: remote,
                    employment_type: employment,
                    min_salary,
                });
            if let Some(location) = location {
                query = query.with_location(location);
            }
            cmd_search(&aggregator, &query, &ctx, cli.format).await?;
        }
        Commands::Details {
            source,
            external_id,
        } => {
            let aggregator = build_aggregator(&config, cli.rate_limit_store, &[source]).await?;
            let job = aggregator
                .get_job_details(source, &external_id, &ctx)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_jobs(std::slice::from_ref(&job), cli.format)?;
        }
        Commands::Sources => {
            let aggregator = build_aggregator(&config, cli.rate_limit_store, &[]).await?;
            let overview = aggregator.source_overview(ctx.user_id.as_deref()).await;
            print_sources(&overview, cli.format)?;
        }
    }

    Ok(())
}

/// Wire adapters, limiter and tracer together. An empty `only` keeps every
/// shipped adapter.
async fn build_aggregator(
    config: &QuarryConfig,
    store: StoreKind,
    only: &[JobSource],
) -> Result<JobAggregator> {
    let limiter = match store {
        StoreKind::Memory => RateLimiter::new(config.rate_limits.clone()),
        StoreKind::Postgres => {
            let db_config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
            let db = Database::connect(&db_config)
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .context("Shared rate-limit store unavailable")?;
            db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
            RateLimiter::with_store(Arc::new(db.counter_store()), config.rate_limits.clone())
        }
    };

    let adapters = quarry_client::default_adapters().context("Failed to create HTTP clients")?;
    let aggregator = adapters
        .into_iter()
        .filter(|a| only.is_empty() || only.contains(&a.source()))
        .fold(
            JobAggregator::new(
                config.aggregator.clone(),
                Arc::new(limiter),
                Tracer::new("quarry-cli"),
            ),
            JobAggregator::with_adapter,
        );

    if aggregator.sources().is_empty() {
        anyhow::bail!("No adapter available for the requested sources");
    }
    Ok(aggregator)
}

async fn cmd_search(
    aggregator: &JobAggregator,
    query: &JobSearchQuery,
    ctx: &SearchContext,
    format: OutputFormat,
) -> Result<()> {
    let SearchOutcome { jobs, reports, .. } = aggregator
        .search_jobs_detailed(query, ctx)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    for report in &reports {
        match report.status {
            SourceStatus::Ok => tracing::info!(
                source = %report.source,
                jobs = report.jobs,
                elapsed_ms = report.elapsed_ms,
                "Source answered"
            ),
            SourceStatus::Skipped => {
                tracing::info!(source = %report.source, "Source skipped (not configured)")
            }
            SourceStatus::Failed => tracing::warn!(
                source = %report.source,
                kind = report.error_kind.unwrap_or("unknown"),
                error = report.error.as_deref().unwrap_or_default(),
                "Source failed"
            ),
        }
    }

    print_jobs(&jobs, format)
}

/// Flat row used for table and CSV output.
#[derive(Serialize)]
struct JobRow<'a> {
    source: &'a str,
    external_id: &'a str,
    posted: String,
    title: &'a str,
    company: &'a str,
    location: &'a str,
    remote: &'a str,
    employment: &'a str,
    salary: String,
    apply_url: &'a str,
}

impl<'a> From<&'a Job> for JobRow<'a> {
    fn from(job: &'a Job) -> Self {
        let salary = match &job.salary {
            Some(s) => {
                let fmt = |v: Option<f64>| v.map(|n| format!("{n:.0}")).unwrap_or_default();
                format!(
                    "{}-{} {}",
                    fmt(s.min),
                    fmt(s.max),
                    s.currency.as_deref().unwrap_or("")
                )
                .trim()
                .to_string()
            }
            None => String::new(),
        };
        Self {
            source: job.source.as_str(),
            external_id: &job.external_id,
            posted: job.posted_at.format("%Y-%m-%d").to_string(),
            title: &job.title,
            company: &job.company,
            location: &job.location,
            remote: job.remote_type.as_str(),
            employment: job.employment_type.as_str(),
            salary,
            apply_url: &job.apply_url,
        }
    }
}

fn print_jobs(jobs: &[Job], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(jobs)?),
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            for job in jobs {
                writer.serialize(JobRow::from(job))?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found");
                return Ok(());
            }
            let mut out = std::io::stdout().lock();
            writeln!(
                out,
                "{:<9} {:<10} {:<36} {:<24} {:<20} {:<8} {}",
                "SOURCE", "POSTED", "TITLE", "COMPANY", "LOCATION", "REMOTE", "SALARY"
            )?;
            for job in jobs {
                let row = JobRow::from(job);
                writeln!(
                    out,
                    "{:<9} {:<10} {:<36} {:<24} {:<20} {:<8} {}",
                    row.source,
                    row.posted,
                    truncate(row.title, 36),
                    truncate(row.company, 24),
                    truncate(row.location, 20),
                    row.remote,
                    row.salary
                )?;
            }
            writeln!(out, "\nTotal: {} jobs", jobs.len())?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct SourceRow {
    source: &'static str,
    configured: bool,
    circuit: &'static str,
    consecutive_failures: u32,
    total_failures: u64,
    remaining_short: Option<u32>,
    remaining_long: Option<u32>,
}

fn print_sources(overview: &[SourceOverview], format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(overview)?);
        return Ok(());
    }

    let rows: Vec<SourceRow> = overview
        .iter()
        .map(|o| SourceRow {
            source: o.source.as_str(),
            configured: o.configured,
            circuit: o.circuit.state.as_str(),
            consecutive_failures: o.circuit.failure_count,
            total_failures: o.circuit.total_failures,
            remaining_short: o.rate_limit.map(|r| r.short_window),
            remaining_long: o.rate_limit.map(|r| r.long_window),
        })
        .collect();

    if let OutputFormat::Csv = format {
        let mut writer = csv::Writer::from_writer(std::io::stdout());
        for row in &rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        return Ok(());
    }

    let quota = |v: Option<u32>| match v {
        Some(u32::MAX) => "unlimited".to_string(),
        Some(n) => n.to_string(),
        None => "?".to_string(),
    };
    println!(
        "{:<10} {:<10} {:<10} {:<9} {:<12} {}",
        "SOURCE", "CONFIGURED", "CIRCUIT", "FAILURES", "QUOTA/SHORT", "QUOTA/LONG"
    );
    for row in rows {
        println!(
            "{:<10} {:<10} {:<10} {:<9} {:<12} {}",
            row.source,
            if row.configured { "yes" } else { "no" },
            row.circuit,
            row.consecutive_failures,
            quota(row.remaining_short),
            quota(row.remaining_long)
        );
    }
    Ok(())
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
