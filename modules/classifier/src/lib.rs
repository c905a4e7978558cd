//! Per-candidate malicious classification and in-run deduplication.

use std::collections::HashSet;

use intel_sqlite::{DataSourceId, OrgId, PermutationRow, SubDomainId};
use permwatch_core::SERVFAIL;
use threat_feeds::{BlocklistSignal, FeedError, IntelFeeds, ThreatFeedSignal};
use variant_gen::PermutationCandidate;

/// Accumulated enrichment verdict for one candidate across both address
/// families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verdict {
    pub malicious: bool,
    pub blocklist_attacks: i64,
    pub blocklist_reports: i64,
    pub threat_feed_records: i64,
    pub threat_feed_attacks: i64,
}

impl Verdict {
    /// Fold one address family's feed results into the verdict.
    ///
    /// The last family checked wins where it has something to say: a
    /// non-clean blocklist result replaces the attack/report counts while a
    /// clean one leaves them untouched, and the threat-feed counts always
    /// track the most recent lookup, dropping back to zero when the address
    /// is not listed. The malicious flag is sticky.
    pub fn fold(&mut self, blocklist: BlocklistSignal, threatfeed: ThreatFeedSignal) {
        if blocklist.malicious {
            self.malicious = true;
            self.blocklist_attacks = blocklist.attacks;
            self.blocklist_reports = blocklist.reports;
        }
        if threatfeed.listed {
            self.malicious = true;
        }
        self.threat_feed_records = threatfeed.record_count;
        self.threat_feed_attacks = threatfeed.attack_count;
    }
}

/// Classify one candidate. Returns `Ok(None)` for candidates that carry no
/// classifiable signal: the seed domain itself and candidates without an A
/// record. Feed failures propagate; quiet feed responses do not.
pub async fn classify<F: IntelFeeds>(
    feeds: &F,
    candidate: &PermutationCandidate,
) -> Result<Option<Verdict>, FeedError> {
    if candidate.is_original() {
        return Ok(None);
    }
    let Some(ipv4) = candidate.ipv4() else {
        return Ok(None);
    };
    let mut verdict = Verdict::default();
    enrich_family(feeds, ipv4, &mut verdict).await?;
    if let Some(ipv6) = candidate.ipv6() {
        enrich_family(feeds, ipv6, &mut verdict).await?;
    }
    Ok(Some(verdict))
}

/// Query both feeds for one address value, then fold. The `"!ServFail"`
/// placeholder short-circuits: resolution already failed upstream, so no
/// lookup is issued and the verdict is untouched. Both feed calls complete
/// before the fold so the per-family ordering stays deterministic.
async fn enrich_family<F: IntelFeeds>(
    feeds: &F,
    addr: &str,
    verdict: &mut Verdict,
) -> Result<(), FeedError> {
    if addr == SERVFAIL {
        return Ok(());
    }
    let (blocklist, threatfeed) = tokio::join!(feeds.blocklist(addr), feeds.threatfeed(addr));
    verdict.fold(blocklist?, threatfeed?);
    Ok(())
}

/// Shape a classified candidate for the bulk upsert. Every text column is
/// non-null: record values the engine did not attach become empty strings.
pub fn build_row(
    candidate: &PermutationCandidate,
    verdict: Verdict,
    org_id: OrgId,
    data_source_id: DataSourceId,
    sub_domain_id: SubDomainId,
    date_active: &str,
) -> PermutationRow {
    PermutationRow {
        org_id,
        data_source_id,
        sub_domain_id,
        domain_permutation: candidate.domain.clone(),
        ipv4: candidate.ipv4().unwrap_or_default().to_string(),
        ipv6: candidate.ipv6().unwrap_or_default().to_string(),
        mail_server: candidate.mail_server().unwrap_or_default().to_string(),
        name_server: candidate.name_server().unwrap_or_default().to_string(),
        fuzzer: candidate.fuzzer.clone(),
        date_active: date_active.to_string(),
        ssdeep_score: candidate.ssdeep_score.clone().unwrap_or_default(),
        malicious: verdict.malicious,
        blocklist_attack_count: verdict.blocklist_attacks,
        blocklist_report_count: verdict.blocklist_reports,
        threat_feed_record_count: verdict.threat_feed_records,
        threat_feed_attack_count: verdict.threat_feed_attacks,
    }
}

/// In-run duplicate suppression for permutation strings. First occurrence
/// wins; scope is one organization's run, never longer.
#[derive(Debug, Default)]
pub struct Deduper {
    seen: HashSet<String>,
}

impl Deduper {
    pub fn new() -> Self {
        Deduper::default()
    }

    /// True exactly once per domain string.
    pub fn admit(&mut self, domain: &str) -> bool {
        self.seen.insert(domain.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeFeeds {
        blocklist: HashMap<String, BlocklistSignal>,
        threatfeed: HashMap<String, ThreatFeedSignal>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeFeeds {
        fn quiet() -> Self {
            FakeFeeds {
                blocklist: HashMap::new(),
                threatfeed: HashMap::new(),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl IntelFeeds for FakeFeeds {
        async fn blocklist(&self, ip: &str) -> Result<BlocklistSignal, FeedError> {
            self.calls.borrow_mut().push(format!("blocklist:{ip}"));
            Ok(self.blocklist.get(ip).copied().unwrap_or_default())
        }

        async fn threatfeed(&self, ip: &str) -> Result<ThreatFeedSignal, FeedError> {
            self.calls.borrow_mut().push(format!("threatfeed:{ip}"));
            Ok(self.threatfeed.get(ip).copied().unwrap_or_default())
        }
    }

    fn cand(domain: &str, fuzzer: &str, a: Option<&str>, aaaa: Option<&str>) -> PermutationCandidate {
        PermutationCandidate {
            domain: domain.to_string(),
            fuzzer: fuzzer.to_string(),
            dns_a: a.map(|v| vec![v.to_string()]),
            dns_aaaa: aaaa.map(|v| vec![v.to_string()]),
            dns_mx: None,
            dns_ns: None,
            ssdeep_score: None,
        }
    }

    #[tokio::test]
    async fn quiet_feeds_yield_benign_verdict() {
        let feeds = FakeFeeds::quiet();
        let c = cand("examp1e.com", "bitsquatting", Some("10.0.0.1"), None);
        let verdict = classify(&feeds, &c).await.unwrap().unwrap();
        assert!(!verdict.malicious);
        assert_eq!(verdict.blocklist_attacks, 0);
        assert_eq!(verdict.threat_feed_records, 0);
        assert_eq!(feeds.call_count(), 2);
    }

    #[tokio::test]
    async fn blocklist_hit_flags_malicious_with_counts() {
        let mut feeds = FakeFeeds::quiet();
        feeds.blocklist.insert(
            "10.0.0.1".to_string(),
            BlocklistSignal { malicious: true, attacks: 5, reports: 2 },
        );
        let c = cand("examp1e.com", "bitsquatting", Some("10.0.0.1"), None);
        let verdict = classify(&feeds, &c).await.unwrap().unwrap();
        assert!(verdict.malicious);
        assert_eq!(verdict.blocklist_attacks, 5);
        assert_eq!(verdict.blocklist_reports, 2);
    }

    #[tokio::test]
    async fn threatfeed_listing_flags_malicious() {
        let mut feeds = FakeFeeds::quiet();
        feeds.threatfeed.insert(
            "10.0.0.1".to_string(),
            ThreatFeedSignal { listed: true, record_count: 3, attack_count: 9 },
        );
        let c = cand("examp1e.com", "bitsquatting", Some("10.0.0.1"), None);
        let verdict = classify(&feeds, &c).await.unwrap().unwrap();
        assert!(verdict.malicious);
        assert_eq!(verdict.threat_feed_records, 3);
        assert_eq!(verdict.threat_feed_attacks, 9);
    }

    #[tokio::test]
    async fn unresolved_candidate_is_skipped_silently() {
        let feeds = FakeFeeds::quiet();
        let c = cand("examp1e.com", "bitsquatting", None, None);
        assert!(classify(&feeds, &c).await.unwrap().is_none());
        assert_eq!(feeds.call_count(), 0);
    }

    #[tokio::test]
    async fn seed_domain_is_never_classified() {
        let feeds = FakeFeeds::quiet();
        let c = cand("example.com", "*original", Some("10.0.0.1"), None);
        assert!(classify(&feeds, &c).await.unwrap().is_none());
        assert_eq!(feeds.call_count(), 0);
    }

    #[tokio::test]
    async fn servfail_address_is_never_looked_up() {
        let mut feeds = FakeFeeds::quiet();
        feeds.threatfeed.insert(
            "2001:db8::1".to_string(),
            ThreatFeedSignal { listed: true, record_count: 1, attack_count: 0 },
        );
        let c = cand("examp1e.com", "bitsquatting", Some("!ServFail"), Some("2001:db8::1"));
        let verdict = classify(&feeds, &c).await.unwrap().unwrap();
        // The v6 family still produced a signal; the v4 placeholder made no calls.
        assert!(verdict.malicious);
        assert!(feeds.calls.borrow().iter().all(|c| !c.contains("ServFail")));
        assert_eq!(feeds.call_count(), 2);
    }

    #[tokio::test]
    async fn later_family_overwrites_blocklist_counts_only_on_signal() {
        let mut feeds = FakeFeeds::quiet();
        feeds.blocklist.insert(
            "10.0.0.1".to_string(),
            BlocklistSignal { malicious: true, attacks: 5, reports: 2 },
        );
        // v6 blocklist is clean: the v4 counts must survive.
        let c = cand("examp1e.com", "bitsquatting", Some("10.0.0.1"), Some("2001:db8::1"));
        let verdict = classify(&feeds, &c).await.unwrap().unwrap();
        assert!(verdict.malicious);
        assert_eq!(verdict.blocklist_attacks, 5);
        assert_eq!(verdict.blocklist_reports, 2);
    }

    #[tokio::test]
    async fn unlisted_later_family_resets_threat_feed_counts() {
        let mut feeds = FakeFeeds::quiet();
        feeds.threatfeed.insert(
            "10.0.0.1".to_string(),
            ThreatFeedSignal { listed: true, record_count: 4, attack_count: 11 },
        );
        // v6 is not listed anywhere; its lookup clears the v4 counts but the
        // malicious flag is sticky.
        let c = cand("examp1e.com", "bitsquatting", Some("10.0.0.1"), Some("2001:db8::1"));
        let verdict = classify(&feeds, &c).await.unwrap().unwrap();
        assert!(verdict.malicious);
        assert_eq!(verdict.threat_feed_records, 0);
        assert_eq!(verdict.threat_feed_attacks, 0);
    }

    #[tokio::test]
    async fn feed_failures_propagate() {
        struct FailingFeeds;
        impl IntelFeeds for FailingFeeds {
            async fn blocklist(&self, ip: &str) -> Result<BlocklistSignal, FeedError> {
                Err(FeedError::Status { feed: "blocklist", ip: ip.to_string(), status: 503 })
            }
            async fn threatfeed(&self, _ip: &str) -> Result<ThreatFeedSignal, FeedError> {
                Ok(ThreatFeedSignal::default())
            }
        }
        let c = cand("examp1e.com", "bitsquatting", Some("10.0.0.1"), None);
        assert!(classify(&FailingFeeds, &c).await.is_err());
    }

    #[test]
    fn rows_have_uniform_shape() {
        let c = cand("examp1e.com", "bitsquatting", Some("10.0.0.1"), None);
        let row = build_row(&c, Verdict::default(), 1, 1, 1, "2026-08-07");
        assert_eq!(row.ipv4, "10.0.0.1");
        assert_eq!(row.ipv6, "");
        assert_eq!(row.mail_server, "");
        assert_eq!(row.name_server, "");
        assert_eq!(row.ssdeep_score, "");
        assert_eq!(row.date_active, "2026-08-07");
    }

    #[test]
    fn dedup_admits_first_occurrence_only() {
        let mut dedup = Deduper::new();
        assert!(dedup.admit("examp1e.net"));
        assert!(!dedup.admit("examp1e.net"));
        assert!(dedup.admit("examp1e.org"));
    }
}
