//! Run orchestration: drives candidate generation, classification,
//! deduplication, and persistence per organization, isolating failures so
//! one bad root domain never takes down the run.

use anyhow::Result;
use classifier::{build_row, classify, Deduper};
use futures::stream::{self, StreamExt};
use intel_sqlite::{DataSourceId, Db, Organization, PermutationRow, RunFailure, RunMeta};
use permwatch_core::NULL_ROOT;
use thiserror::Error;
use threat_feeds::{FeedError, IntelFeeds};
use tracing::{debug, info, warn};
use uuid::Uuid;
use variant_gen::{expand_root, FuzzEngine};

/// Per-organization progression. `Failed` marks an organization that
/// contributed at least one failure record or produced no rows at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrgState {
    Pending,
    GeneratingCandidates,
    Classifying,
    Deduplicating,
    Persisting,
    Committed,
    Failed,
}

impl std::fmt::Display for OrgState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrgState::Pending => "pending",
            OrgState::GeneratingCandidates => "generating-candidates",
            OrgState::Classifying => "classifying",
            OrgState::Deduplicating => "deduplicating",
            OrgState::Persisting => "persisting",
            OrgState::Committed => "committed",
            OrgState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("candidate generation failed for {root_domain}: {cause}")]
    Generation { root_domain: String, cause: anyhow::Error },

    #[error("enrichment failed for {domain} under {root_domain}: {source}")]
    Enrichment {
        root_domain: String,
        domain: String,
        #[source]
        source: FeedError,
    },

    #[error("subdomain resolution failed for {root_domain}: {cause}")]
    Resolver { root_domain: String, cause: anyhow::Error },

    #[error("batch upsert failed for {organization}: {cause}")]
    Persistence { organization: String, cause: anyhow::Error },

    #[error("no permutations classified for {organization}")]
    EmptyBatch { organization: String },
}

impl StageFailure {
    /// Stage the organization was in when the failure surfaced.
    pub fn state(&self) -> OrgState {
        match self {
            StageFailure::Generation { .. } => OrgState::GeneratingCandidates,
            StageFailure::Enrichment { .. } | StageFailure::Resolver { .. } => OrgState::Classifying,
            StageFailure::Persistence { .. } | StageFailure::EmptyBatch { .. } => OrgState::Persisting,
        }
    }
}

#[derive(Debug)]
pub struct OrgOutcome {
    pub organization: String,
    pub state: OrgState,
    pub rows_upserted: usize,
    pub failures: Vec<RunFailure>,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub orgs_processed: usize,
    pub rows_upserted: usize,
    /// Organizations with at least one failure record, in completion order.
    pub failed_orgs: Vec<String>,
    pub failures: Vec<RunFailure>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Process only the named organization when set.
    pub org_filter: Option<String>,
    pub org_concurrency: usize,
    /// Stamped into every upserted row as `date_active` (YYYY-MM-DD).
    pub date_active: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions { org_filter: None, org_concurrency: 4, date_active: String::new() }
    }
}

/// Everything one organization's processing needs, passed explicitly; the
/// pipeline holds no process-wide state.
struct RunContext<'a, E, F> {
    db: &'a Db,
    engine: &'a E,
    feeds: &'a F,
    data_source_id: DataSourceId,
    date_active: &'a str,
}

/// Drive the full pipeline over the stored organizations. Organizations are
/// processed with bounded concurrency; their failure records are merged
/// after completion and written to the run ledger.
pub async fn run<E: FuzzEngine, F: IntelFeeds>(
    db: &Db,
    engine: &E,
    feeds: &F,
    opts: &RunOptions,
) -> Result<RunReport> {
    let data_source_id = db.ensure_data_source(permwatch_core::DATA_SOURCE)?;
    db.touch_data_source(data_source_id, &opts.date_active)?;

    let run_id = Uuid::new_v4();
    db.begin_run(&RunMeta { run_id, started_at_ms: now_ms() })?;

    let orgs: Vec<Organization> = match &opts.org_filter {
        Some(name) => db.organization_by_name(name)?.into_iter().collect(),
        None => db.organizations()?,
    };
    info!(run = %run_id, organizations = orgs.len(), "starting permutation run");

    let ctx = RunContext { db, engine, feeds, data_source_id, date_active: &opts.date_active };
    let outcomes: Vec<OrgOutcome> = stream::iter(orgs)
        .map(|org| process_org(&ctx, org))
        .buffer_unordered(opts.org_concurrency.max(1))
        .collect()
        .await;

    let mut report = RunReport {
        run_id,
        orgs_processed: 0,
        rows_upserted: 0,
        failed_orgs: Vec::new(),
        failures: Vec::new(),
    };
    for outcome in outcomes {
        report.orgs_processed += 1;
        report.rows_upserted += outcome.rows_upserted;
        if outcome.state == OrgState::Failed {
            report.failed_orgs.push(outcome.organization.clone());
        }
        for failure in outcome.failures {
            db.add_run_failure(&run_id, &failure)?;
            report.failures.push(failure);
        }
    }
    db.finish_run(
        &run_id,
        now_ms(),
        report.orgs_processed as i64,
        report.rows_upserted as i64,
        report.failures.len() as i64,
    )?;
    if !report.failed_orgs.is_empty() {
        warn!(failed = ?report.failed_orgs, "organizations failed this run");
    }
    Ok(report)
}

async fn process_org<E: FuzzEngine, F: IntelFeeds>(
    ctx: &RunContext<'_, E, F>,
    org: Organization,
) -> OrgOutcome {
    let mut state = OrgState::Pending;
    let mut failures: Vec<RunFailure> = Vec::new();
    let mut batch: Vec<PermutationRow> = Vec::new();
    // Duplicate suppression is scoped to this organization's run.
    let mut dedup = Deduper::new();

    let root_domains = match ctx.db.root_domains(org.org_id) {
        Ok(domains) => domains,
        Err(e) => {
            warn!(org = %org.name, error = %e, "root domain listing failed");
            failures.push(RunFailure {
                organization: org.name.clone(),
                root_domain: None,
                stage: OrgState::Pending.to_string(),
                message: e.to_string(),
                at_ms: now_ms(),
            });
            return OrgOutcome {
                organization: org.name,
                state: OrgState::Failed,
                rows_upserted: 0,
                failures,
            };
        }
    };

    for rd in &root_domains {
        if rd.root_domain == NULL_ROOT {
            debug!(org = %org.name, "skipping placeholder root domain");
            continue;
        }
        match process_root_domain(ctx, &org, &rd.root_domain, &mut dedup, &mut state).await {
            Ok(rows) => batch.extend(rows),
            Err(failure) => {
                warn!(org = %org.name, root_domain = %rd.root_domain, %failure, "root domain failed");
                failures.push(failure_record(&org.name, Some(&rd.root_domain), &failure));
            }
        }
    }

    advance(&mut state, OrgState::Persisting, &org.name);
    if batch.is_empty() {
        let failure = StageFailure::EmptyBatch { organization: org.name.clone() };
        warn!(org = %org.name, "nothing to persist");
        failures.push(failure_record(&org.name, None, &failure));
        return OrgOutcome {
            organization: org.name,
            state: OrgState::Failed,
            rows_upserted: 0,
            failures,
        };
    }
    match ctx.db.upsert_permutations(&batch) {
        Ok(count) => {
            info!(org = %org.name, rows = count, "batch committed");
            let final_state = if failures.is_empty() { OrgState::Committed } else { OrgState::Failed };
            OrgOutcome { organization: org.name, state: final_state, rows_upserted: count, failures }
        }
        Err(e) => {
            let failure = StageFailure::Persistence { organization: org.name.clone(), cause: e };
            warn!(org = %org.name, %failure, "batch upsert failed");
            failures.push(failure_record(&org.name, None, &failure));
            OrgOutcome {
                organization: org.name,
                state: OrgState::Failed,
                rows_upserted: 0,
                failures,
            }
        }
    }
}

/// One root domain's contribution: generate, resolve the subdomain identity,
/// classify, deduplicate. Any error aborts only this root domain.
async fn process_root_domain<E: FuzzEngine, F: IntelFeeds>(
    ctx: &RunContext<'_, E, F>,
    org: &Organization,
    root_domain: &str,
    dedup: &mut Deduper,
    state: &mut OrgState,
) -> Result<Vec<PermutationRow>, StageFailure> {
    advance(state, OrgState::GeneratingCandidates, &org.name);
    let candidates = expand_root(ctx.engine, root_domain)
        .await
        .map_err(|cause| StageFailure::Generation { root_domain: root_domain.to_string(), cause })?;
    debug!(org = %org.name, root_domain, candidates = candidates.len(), "candidates generated");

    let sub_domain_id = ctx
        .db
        .ensure_sub_domain(org.org_id, root_domain, ctx.data_source_id)
        .map_err(|cause| StageFailure::Resolver { root_domain: root_domain.to_string(), cause })?;

    advance(state, OrgState::Classifying, &org.name);
    let mut classified = Vec::new();
    for candidate in &candidates {
        let verdict = classify(ctx.feeds, candidate).await.map_err(|source| {
            StageFailure::Enrichment {
                root_domain: root_domain.to_string(),
                domain: candidate.domain.clone(),
                source,
            }
        })?;
        if let Some(verdict) = verdict {
            classified.push((candidate, verdict));
        }
    }

    advance(state, OrgState::Deduplicating, &org.name);
    let mut rows = Vec::new();
    for (candidate, verdict) in classified {
        if dedup.admit(&candidate.domain) {
            rows.push(build_row(
                candidate,
                verdict,
                org.org_id,
                ctx.data_source_id,
                sub_domain_id,
                ctx.date_active,
            ));
        }
    }
    Ok(rows)
}

fn advance(state: &mut OrgState, next: OrgState, org: &str) {
    if *state != next {
        debug!(org, from = %state, to = %next, "state transition");
        *state = next;
    }
}

fn failure_record(org: &str, root_domain: Option<&str>, failure: &StageFailure) -> RunFailure {
    RunFailure {
        organization: org.to_string(),
        root_domain: root_domain.map(str::to_string),
        stage: failure.state().to_string(),
        message: failure.to_string(),
        at_ms: now_ms(),
    }
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use threat_feeds::{BlocklistSignal, ThreatFeedSignal};
    use variant_gen::PermutationCandidate;

    struct FakeEngine {
        responses: HashMap<String, Vec<PermutationCandidate>>,
        failing: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        fn new() -> Self {
            FakeEngine { responses: HashMap::new(), failing: Vec::new(), calls: Mutex::new(Vec::new()) }
        }

        fn with(mut self, domain: &str, candidates: Vec<PermutationCandidate>) -> Self {
            self.responses.insert(domain.to_string(), candidates);
            self
        }

        fn failing_on(mut self, domain: &str) -> Self {
            self.failing.push(domain.to_string());
            self
        }
    }

    impl FuzzEngine for FakeEngine {
        async fn generate(&self, domain: &str) -> Result<Vec<PermutationCandidate>> {
            self.calls.lock().unwrap().push(domain.to_string());
            if self.failing.iter().any(|d| d == domain) {
                return Err(anyhow!("engine exploded on {domain}"));
            }
            Ok(self.responses.get(domain).cloned().unwrap_or_default())
        }
    }

    struct QuietFeeds {
        blocklist: HashMap<String, BlocklistSignal>,
    }

    impl QuietFeeds {
        fn new() -> Self {
            QuietFeeds { blocklist: HashMap::new() }
        }
    }

    impl IntelFeeds for QuietFeeds {
        async fn blocklist(&self, ip: &str) -> Result<BlocklistSignal, FeedError> {
            Ok(self.blocklist.get(ip).copied().unwrap_or_default())
        }

        async fn threatfeed(&self, _ip: &str) -> Result<ThreatFeedSignal, FeedError> {
            Ok(ThreatFeedSignal::default())
        }
    }

    fn cand(domain: &str, fuzzer: &str, a: Option<&str>) -> PermutationCandidate {
        PermutationCandidate {
            domain: domain.to_string(),
            fuzzer: fuzzer.to_string(),
            dns_a: a.map(|v| vec![v.to_string()]),
            dns_aaaa: None,
            dns_mx: None,
            dns_ns: None,
            ssdeep_score: None,
        }
    }

    fn opts() -> RunOptions {
        RunOptions { org_filter: None, org_concurrency: 2, date_active: "2026-08-07".to_string() }
    }

    fn seeded(domains: &[(&str, &[&str])]) -> Db {
        let db = Db::open_in_memory().unwrap();
        for (org, roots) in domains {
            let org_id = db.ensure_organization(org).unwrap();
            for root in *roots {
                db.ensure_root_domain(org_id, root).unwrap();
            }
        }
        db
    }

    #[tokio::test]
    async fn null_root_is_skipped_without_failure() {
        let db = seeded(&[("Example Agency", &["Null_Root", "example.gov"][..])]);
        let engine = FakeEngine::new()
            .with("example.gov", vec![cand("examp1e.gov", "bitsquatting", Some("10.0.0.1"))]);
        let report = run(&db, &engine, &QuietFeeds::new(), &opts()).await.unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert!(!calls.iter().any(|c| c == "Null_Root"));
        assert!(report.failed_orgs.is_empty());
        assert_eq!(report.rows_upserted, 1);
    }

    #[tokio::test]
    async fn org_failure_is_isolated() {
        let db = seeded(&[
            ("Broken Agency", &["broken.gov"][..]),
            ("Example Agency", &["example.gov"][..]),
        ]);
        let engine = FakeEngine::new()
            .failing_on("broken.gov")
            .with("example.gov", vec![cand("examp1e.gov", "bitsquatting", Some("10.0.0.1"))]);
        let report = run(&db, &engine, &QuietFeeds::new(), &opts()).await.unwrap();

        assert_eq!(report.failed_orgs, vec!["Broken Agency".to_string()]);
        assert_eq!(report.rows_upserted, 1);
        let org = db.organization_by_name("Example Agency").unwrap().unwrap();
        assert_eq!(db.permutation_count(org.org_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn root_domain_failure_keeps_siblings() {
        let db = seeded(&[("Example Agency", &["broken.gov", "example.gov"][..])]);
        let engine = FakeEngine::new()
            .failing_on("broken.gov")
            .with("example.gov", vec![cand("examp1e.gov", "bitsquatting", Some("10.0.0.1"))]);
        let report = run(&db, &engine, &QuietFeeds::new(), &opts()).await.unwrap();

        // The good sibling still commits, but the org lands in the failure list.
        assert_eq!(report.failed_orgs, vec!["Example Agency".to_string()]);
        assert_eq!(report.rows_upserted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].root_domain.as_deref(), Some("broken.gov"));
        assert_eq!(report.failures[0].stage, "generating-candidates");
    }

    #[tokio::test]
    async fn empty_batch_is_recorded_failed_without_upsert() {
        let db = seeded(&[("Example Agency", &["example.gov"][..])]);
        // Only the seed comes back; classification drops it.
        let engine = FakeEngine::new()
            .with("example.gov", vec![cand("example.gov", "*original", Some("10.0.0.1"))]);
        let report = run(&db, &engine, &QuietFeeds::new(), &opts()).await.unwrap();

        assert_eq!(report.failed_orgs, vec!["Example Agency".to_string()]);
        assert_eq!(report.rows_upserted, 0);
        let org = db.organization_by_name("Example Agency").unwrap().unwrap();
        assert_eq!(db.permutation_count(org.org_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn seed_domain_never_persists() {
        let db = seeded(&[("Example Agency", &["example.gov"][..])]);
        let engine = FakeEngine::new().with(
            "example.gov",
            vec![
                cand("example.gov", "*original", Some("10.0.0.1")),
                cand("examp1e.gov", "bitsquatting", Some("10.0.0.2")),
            ],
        );
        let report = run(&db, &engine, &QuietFeeds::new(), &opts()).await.unwrap();

        assert_eq!(report.rows_upserted, 1);
        let org = db.organization_by_name("Example Agency").unwrap().unwrap();
        let rows = db.permutations(org.org_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].domain_permutation, "examp1e.gov");
    }

    #[tokio::test]
    async fn duplicate_permutations_collapse_across_levels() {
        let db = seeded(&[("Example Agency", &["example.gov"][..])]);
        let engine = FakeEngine::new()
            .with(
                "example.gov",
                vec![cand("examp1e.net", "bitsquatting", Some("10.0.0.1"))],
            )
            .with(
                "examp1e.net",
                vec![cand("examp1e.net", "homoglyph", Some("10.0.0.1"))],
            );
        let report = run(&db, &engine, &QuietFeeds::new(), &opts()).await.unwrap();

        assert_eq!(report.rows_upserted, 1);
        let org = db.organization_by_name("Example Agency").unwrap().unwrap();
        let rows = db.permutations(org.org_id).unwrap();
        assert_eq!(rows.len(), 1);
        // First occurrence wins: the first-level tag survives.
        assert_eq!(rows[0].fuzzer, "bitsquatting");
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let db = seeded(&[("Example Agency", &["example.gov"][..])]);
        let engine = FakeEngine::new().with(
            "example.gov",
            vec![
                cand("examp1e.gov", "bitsquatting", Some("10.0.0.1")),
                cand("exampie.gov", "homoglyph", Some("10.0.0.2")),
            ],
        );
        let feeds = QuietFeeds::new();

        let first = run(&db, &engine, &feeds, &opts()).await.unwrap();
        let second = run(&db, &engine, &feeds, &opts()).await.unwrap();

        assert_eq!(first.rows_upserted, 2);
        assert_eq!(second.rows_upserted, 2);
        let org = db.organization_by_name("Example Agency").unwrap().unwrap();
        assert_eq!(db.permutation_count(org.org_id).unwrap(), 2);
    }

    #[tokio::test]
    async fn org_filter_limits_the_run() {
        let db = seeded(&[
            ("Example Agency", &["example.gov"][..]),
            ("Other Agency", &["other.gov"][..]),
        ]);
        let engine = FakeEngine::new()
            .with("example.gov", vec![cand("examp1e.gov", "bitsquatting", Some("10.0.0.1"))])
            .with("other.gov", vec![cand("0ther.gov", "bitsquatting", Some("10.0.0.2"))]);
        let mut options = opts();
        options.org_filter = Some("Example Agency".to_string());
        let report = run(&db, &engine, &QuietFeeds::new(), &options).await.unwrap();

        assert_eq!(report.orgs_processed, 1);
        let other = db.organization_by_name("Other Agency").unwrap().unwrap();
        assert_eq!(db.permutation_count(other.org_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn enrichment_failure_fails_the_root_domain() {
        struct FailingFeeds;
        impl IntelFeeds for FailingFeeds {
            async fn blocklist(&self, ip: &str) -> Result<BlocklistSignal, FeedError> {
                Err(FeedError::Status { feed: "blocklist", ip: ip.to_string(), status: 503 })
            }
            async fn threatfeed(&self, _ip: &str) -> Result<ThreatFeedSignal, FeedError> {
                Ok(ThreatFeedSignal::default())
            }
        }
        let db = seeded(&[("Example Agency", &["example.gov"][..])]);
        let engine = FakeEngine::new()
            .with("example.gov", vec![cand("examp1e.gov", "bitsquatting", Some("10.0.0.1"))]);
        let report = run(&db, &engine, &FailingFeeds, &opts()).await.unwrap();

        assert_eq!(report.failed_orgs, vec!["Example Agency".to_string()]);
        assert!(report.failures.iter().any(|f| f.stage == "classifying"));
        let org = db.organization_by_name("Example Agency").unwrap().unwrap();
        assert_eq!(db.permutation_count(org.org_id).unwrap(), 0);
    }
}
