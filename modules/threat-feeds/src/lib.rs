//! HTTP clients for the two address-enrichment feeds.
//!
//! Both feeds distinguish "no signal" (a normal, quiet outcome) from
//! transport and parse failures, which surface as [`FeedError`] and fail the
//! candidate's root domain for the run.

use permwatch_core::ratelimiter::RateLimiter;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Body the blocklist feed returns for an address with no recorded abuse.
/// The malicious verdict is keyed on the body being exactly this string.
pub const BLOCKLIST_CLEAN: &str = "attacks: 0<br />reports: 0<br />";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("{feed} request for {ip} failed: {source}")]
    Request {
        feed: &'static str,
        ip: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{feed} returned HTTP {status} for {ip}")]
    Status { feed: &'static str, ip: String, status: u16 },
    #[error("malformed {feed} response for {ip}: {detail}")]
    Malformed { feed: &'static str, ip: String, detail: String },
}

/// Blocklist feed result for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlocklistSignal {
    pub malicious: bool,
    pub attacks: i64,
    pub reports: i64,
}

/// Threat-feed membership result for one address. An address absent from
/// every tracked feed is `listed == false` with zero counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreatFeedSignal {
    pub listed: bool,
    pub record_count: i64,
    pub attack_count: i64,
}

/// The pair of enrichment feeds the classifier consults per address.
#[allow(async_fn_in_trait)]
pub trait IntelFeeds {
    async fn blocklist(&self, ip: &str) -> Result<BlocklistSignal, FeedError>;
    async fn threatfeed(&self, ip: &str) -> Result<ThreatFeedSignal, FeedError>;
}

/// Parse a blocklist body against the grammar
/// `"attacks: " <int> "<br />reports: " <int> "<br />"`.
pub fn parse_blocklist(body: &str) -> Result<(i64, i64), String> {
    let attacks = count_after(body, "attacks: ")?;
    let reports = count_after(body, "reports: ")?;
    Ok((attacks, reports))
}

fn count_after(body: &str, marker: &str) -> Result<i64, String> {
    let rest = body
        .split_once(marker)
        .ok_or_else(|| format!("missing {marker:?} marker"))?
        .1;
    let digits = rest.split('<').next().unwrap_or("");
    digits
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("bad count after {marker:?}: {digits:?}"))
}

fn feed_http(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("permwatch/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Client for the free-text blocklist feed, queried as `<base>?ip=<addr>`.
#[derive(Clone)]
pub struct BlocklistClient {
    http: Client,
    base: String,
    pacing: Option<RateLimiter>,
}

impl BlocklistClient {
    pub fn new(
        base: impl Into<String>,
        timeout: Duration,
        pacing: Option<RateLimiter>,
    ) -> Result<Self, reqwest::Error> {
        Ok(BlocklistClient { http: feed_http(timeout)?, base: base.into(), pacing })
    }

    /// Recorded attack/report counts for one address.
    pub async fn check(&self, ip: &str) -> Result<BlocklistSignal, FeedError> {
        const FEED: &str = "blocklist";
        if let Some(pacing) = &self.pacing {
            pacing.acquire().await;
        }
        let url = format!("{}?ip={}", self.base, ip);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Request { feed: FEED, ip: ip.to_string(), source: e })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status { feed: FEED, ip: ip.to_string(), status: status.as_u16() });
        }
        let body = resp
            .text()
            .await
            .map_err(|e| FeedError::Request { feed: FEED, ip: ip.to_string(), source: e })?;
        signal_from_blocklist_body(&body)
            .map_err(|detail| FeedError::Malformed { feed: FEED, ip: ip.to_string(), detail })
    }
}

/// Exact clean sentinel means no signal; anything else must parse and is a
/// malicious signal carrying its counts.
pub fn signal_from_blocklist_body(body: &str) -> Result<BlocklistSignal, String> {
    if body == BLOCKLIST_CLEAN {
        return Ok(BlocklistSignal::default());
    }
    let (attacks, reports) = parse_blocklist(body)?;
    Ok(BlocklistSignal { malicious: true, attacks, reports })
}

#[derive(Debug, Deserialize)]
struct IpEnvelope {
    #[serde(default)]
    ip: IpRecord,
}

#[derive(Debug, Default, Deserialize)]
struct IpRecord {
    #[serde(default)]
    threatfeeds: Option<Vec<String>>,
    #[serde(default)]
    attacks: Option<i64>,
}

/// Client for the structured threat-feed service, queried as
/// `<base>/<addr>?json`.
#[derive(Clone)]
pub struct ThreatFeedClient {
    http: Client,
    base: String,
    pacing: Option<RateLimiter>,
}

impl ThreatFeedClient {
    pub fn new(
        base: impl Into<String>,
        timeout: Duration,
        pacing: Option<RateLimiter>,
    ) -> Result<Self, reqwest::Error> {
        Ok(ThreatFeedClient { http: feed_http(timeout)?, base: base.into(), pacing })
    }

    /// Feed-membership records for one address.
    pub async fn check(&self, ip: &str) -> Result<ThreatFeedSignal, FeedError> {
        const FEED: &str = "threatfeed";
        if let Some(pacing) = &self.pacing {
            pacing.acquire().await;
        }
        let url = format!("{}/{}?json", self.base.trim_end_matches('/'), ip);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Request { feed: FEED, ip: ip.to_string(), source: e })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status { feed: FEED, ip: ip.to_string(), status: status.as_u16() });
        }
        let body = resp
            .text()
            .await
            .map_err(|e| FeedError::Request { feed: FEED, ip: ip.to_string(), source: e })?;
        let envelope: IpEnvelope = serde_json::from_str(&body)
            .map_err(|e| FeedError::Malformed { feed: FEED, ip: ip.to_string(), detail: e.to_string() })?;
        Ok(signal_from_record(envelope.ip))
    }
}

fn signal_from_record(record: IpRecord) -> ThreatFeedSignal {
    match record.threatfeeds {
        Some(feeds) => ThreatFeedSignal {
            listed: true,
            record_count: feeds.len() as i64,
            attack_count: record.attacks.unwrap_or(0),
        },
        // Absence of the key is the normal "not on any feed" outcome.
        None => ThreatFeedSignal::default(),
    }
}

/// Production feed pair backed by the two HTTP clients.
#[derive(Clone)]
pub struct FeedClients {
    pub blocklist: BlocklistClient,
    pub threatfeed: ThreatFeedClient,
}

impl IntelFeeds for FeedClients {
    async fn blocklist(&self, ip: &str) -> Result<BlocklistSignal, FeedError> {
        self.blocklist.check(ip).await
    }

    async fn threatfeed(&self, ip: &str) -> Result<ThreatFeedSignal, FeedError> {
        self.threatfeed.check(ip).await
    }
}
