use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use intel_sqlite::Db;
use perm_pipeline::RunOptions;
use permwatch_core::ratelimiter::RateLimiter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use threat_feeds::{BlocklistClient, FeedClients, ThreatFeedClient};
use tracing::info;
use variant_gen::DnstwistCli;

mod config;

const DEFAULT_BLOCKLIST_URL: &str = "http://api.blocklist.de/api.php";
const DEFAULT_THREATFEED_URL: &str = "https://isc.sans.edu/api/ip";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "permwatch", version, about = "Domain-permutation threat classification pipeline")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./permwatch.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Run the classification pipeline over stored organizations
    Run {
        /// SQLite database path
        #[arg(long, default_value = "permwatch.db")]
        db: PathBuf,
        /// Only process the named organization
        #[arg(long)]
        org: Option<String>,
        /// Organizations processed concurrently
        #[arg(long, default_value_t = 4)]
        org_concurrency: usize,
        /// Path to the dnstwist binary
        #[arg(long, default_value = "dnstwist")]
        engine: PathBuf,
        /// TLD dictionary handed to the engine
        #[arg(long)]
        tld_dict: Option<PathBuf>,
        /// Engine worker threads
        #[arg(long, default_value_t = 8)]
        fuzz_threads: u32,
        /// Per-call engine timeout in seconds
        #[arg(long, default_value_t = 600)]
        engine_timeout_s: u64,
        /// Blocklist feed endpoint
        #[arg(long, default_value = DEFAULT_BLOCKLIST_URL)]
        blocklist_url: String,
        /// Threat-feed endpoint
        #[arg(long, default_value = DEFAULT_THREATFEED_URL)]
        threatfeed_url: String,
        /// Per-call feed timeout in milliseconds
        #[arg(long, default_value_t = 10_000)]
        feed_timeout_ms: u64,
        /// QPS cap across feed queries; 0 disables pacing
        #[arg(long, default_value_t = 0)]
        feed_qps: u32,
    },
    /// Import organizations and root domains from CSV
    Import {
        /// SQLite database path
        #[arg(long, default_value = "permwatch.db")]
        db: PathBuf,
        /// CSV file with an `organization,root_domain` header
        file: PathBuf,
    },
    /// List stored permutations for an organization
    Report {
        /// SQLite database path
        #[arg(long, default_value = "permwatch.db")]
        db: PathBuf,
        /// Organization name
        org: String,
        /// Only rows flagged malicious
        #[arg(long, default_value_t = false)]
        malicious_only: bool,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let loaded_cfg = config::load_config(cli.config.as_deref());
    match cli.command {
        Commands::Version => {
            println!("permwatch {} (core {})", env!("CARGO_PKG_VERSION"), permwatch_core::version());
        }
        Commands::Import { db, file } => import_csv(&db, &file)?,
        Commands::Report { db, org, malicious_only, format } => {
            report(&db, &org, malicious_only, format)?
        }
        Commands::Run {
            db,
            mut org,
            mut org_concurrency,
            mut engine,
            mut tld_dict,
            mut fuzz_threads,
            mut engine_timeout_s,
            mut blocklist_url,
            mut threatfeed_url,
            mut feed_timeout_ms,
            mut feed_qps,
        } => {
            if let Some(cfg) = &loaded_cfg {
                if let Some(r) = &cfg.run {
                    if org.is_none() { org = r.org.clone(); }
                    if let Some(v) = r.org_concurrency { org_concurrency = v; }
                    if let Some(v) = &r.engine { engine = v.clone(); }
                    if tld_dict.is_none() { tld_dict = r.tld_dict.clone(); }
                    if let Some(v) = r.fuzz_threads { fuzz_threads = v; }
                    if let Some(v) = r.engine_timeout_s { engine_timeout_s = v; }
                }
                if let Some(f) = &cfg.feeds {
                    if let Some(v) = &f.blocklist_url { blocklist_url = v.clone(); }
                    if let Some(v) = &f.threatfeed_url { threatfeed_url = v.clone(); }
                    if let Some(v) = f.timeout_ms { feed_timeout_ms = v; }
                    if let Some(v) = f.qps { feed_qps = v; }
                }
            }

            let store = Db::open_or_create(&db)?;
            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(async move {
                let pacing = if feed_qps == 0 { None } else { Some(RateLimiter::new(feed_qps)) };
                let feed_timeout = Duration::from_millis(feed_timeout_ms);
                let feeds = FeedClients {
                    blocklist: BlocklistClient::new(blocklist_url, feed_timeout, pacing.clone())?,
                    threatfeed: ThreatFeedClient::new(threatfeed_url, feed_timeout, pacing)?,
                };
                let fuzz = DnstwistCli {
                    binary: engine,
                    tld_dict,
                    threads: fuzz_threads,
                    timeout: Duration::from_secs(engine_timeout_s),
                };
                let opts = RunOptions {
                    org_filter: org,
                    org_concurrency,
                    date_active: today_utc(),
                };
                perm_pipeline::run(&store, &fuzz, &feeds, &opts).await
            })?;

            println!(
                "run {}: {} organizations, {} rows upserted",
                report.run_id, report.orgs_processed, report.rows_upserted
            );
            if !report.failed_orgs.is_empty() {
                eprintln!("these organizations failed:");
                for name in &report.failed_orgs {
                    eprintln!("  {}", name);
                }
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn today_utc() -> String {
    let d = time::OffsetDateTime::now_utc().date();
    format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day())
}

#[derive(Debug, Deserialize)]
struct ImportRecord {
    organization: String,
    root_domain: String,
}

fn import_csv(db_path: &Path, file: &Path) -> Result<()> {
    let db = Db::open_or_create(db_path)?;
    let mut rdr = csv::Reader::from_path(file)?;
    let mut domains = 0usize;
    for record in rdr.deserialize::<ImportRecord>() {
        let record = record?;
        let org = record.organization.trim();
        let root = record.root_domain.trim();
        if org.is_empty() || root.is_empty() {
            continue;
        }
        let org_id = db.ensure_organization(org)?;
        db.ensure_root_domain(org_id, root)?;
        domains += 1;
    }
    let orgs = db.organizations()?.len();
    info!(domains, organizations = orgs, "import finished");
    println!("imported {} root domains across {} organizations", domains, orgs);
    Ok(())
}

fn report(db_path: &Path, org_name: &str, malicious_only: bool, format: OutputFormat) -> Result<()> {
    let db = Db::open_or_create(db_path)?;
    let org = db
        .organization_by_name(org_name)?
        .ok_or_else(|| anyhow!("unknown organization: {}", org_name))?;
    let mut rows = db.permutations(org.org_id)?;
    if malicious_only {
        rows.retain(|r| r.malicious);
    }
    match format {
        OutputFormat::Text => {
            for r in &rows {
                println!(
                    "{}  fuzzer={} malicious={} ipv4={} attacks={} reports={} feeds={}",
                    r.domain_permutation,
                    r.fuzzer,
                    r.malicious,
                    if r.ipv4.is_empty() { "-" } else { &r.ipv4 },
                    r.blocklist_attack_count,
                    r.blocklist_report_count,
                    r.threat_feed_record_count,
                );
            }
            println!("{}: {} permutations", org.name, rows.len());
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Jsonl => {
            for r in &rows {
                println!("{}", serde_json::to_string(r)?);
            }
        }
    }
    Ok(())
}
