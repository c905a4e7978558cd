//! Wrapper around the external domain fuzz engine plus the two-level
//! candidate expansion the pipeline feeds to classification.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Tag the engine assigns to the seed domain itself.
pub const TAG_ORIGINAL: &str = "original";
/// Tag for variants that only swap the TLD.
pub const TAG_TLD_SWAP: &str = "tld-swap";

/// One candidate domain with the DNS facts the engine attached. Record
/// fields are optional; an unregistered name carries none of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermutationCandidate {
    pub domain: String,
    pub fuzzer: String,
    #[serde(default)]
    pub dns_a: Option<Vec<String>>,
    #[serde(default)]
    pub dns_aaaa: Option<Vec<String>>,
    #[serde(default)]
    pub dns_mx: Option<Vec<String>>,
    #[serde(default)]
    pub dns_ns: Option<Vec<String>>,
    #[serde(default, deserialize_with = "score_as_string")]
    pub ssdeep_score: Option<String>,
}

impl PermutationCandidate {
    /// Engines mark the seed with tags like `*original`; match by containment.
    pub fn is_original(&self) -> bool {
        self.fuzzer.contains(TAG_ORIGINAL)
    }

    pub fn is_tld_swap(&self) -> bool {
        self.fuzzer.contains(TAG_TLD_SWAP)
    }

    /// First A-record value, if the candidate resolved at all.
    pub fn ipv4(&self) -> Option<&str> {
        first(&self.dns_a)
    }

    pub fn ipv6(&self) -> Option<&str> {
        first(&self.dns_aaaa)
    }

    pub fn mail_server(&self) -> Option<&str> {
        first(&self.dns_mx)
    }

    pub fn name_server(&self) -> Option<&str> {
        first(&self.dns_ns)
    }
}

fn first(values: &Option<Vec<String>>) -> Option<&str> {
    values.as_ref().and_then(|v| v.first()).map(|s| s.as_str())
}

/// ssdeep scores arrive as a bare integer or a string depending on the
/// engine build; normalize to a string.
fn score_as_string<'de, D>(de: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }
    Ok(Option::<Raw>::deserialize(de)?.map(|raw| match raw {
        Raw::Num(n) => n.to_string(),
        Raw::Text(s) => s,
    }))
}

/// A fuzz engine maps one domain to its permutation candidates, with DNS
/// facts attached and non-registered names already filtered out engine-side.
#[allow(async_fn_in_trait)]
pub trait FuzzEngine {
    async fn generate(&self, domain: &str) -> Result<Vec<PermutationCandidate>>;
}

/// Engine adapter that shells out to the `dnstwist` binary.
#[derive(Debug, Clone)]
pub struct DnstwistCli {
    pub binary: PathBuf,
    pub tld_dict: Option<PathBuf>,
    pub threads: u32,
    pub timeout: Duration,
}

impl Default for DnstwistCli {
    fn default() -> Self {
        DnstwistCli {
            binary: PathBuf::from("dnstwist"),
            tld_dict: None,
            threads: 8,
            timeout: Duration::from_secs(600),
        }
    }
}

impl FuzzEngine for DnstwistCli {
    async fn generate(&self, domain: &str) -> Result<Vec<PermutationCandidate>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--registered")
            .args(["--format", "json"])
            .args(["--threads", &self.threads.to_string()]);
        if let Some(dict) = &self.tld_dict {
            cmd.arg("--tld").arg(dict);
        }
        cmd.arg(domain);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let out = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("fuzz engine timed out after {:?} on {}", self.timeout, domain))?
            .with_context(|| format!("failed to launch fuzz engine {:?}", self.binary))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!(
                "fuzz engine exited with {} on {}: {}",
                out.status,
                domain,
                stderr.trim()
            ));
        }
        parse_engine_output(&out.stdout)
    }
}

pub fn parse_engine_output(raw: &[u8]) -> Result<Vec<PermutationCandidate>> {
    serde_json::from_slice(raw).context("unparseable fuzz engine output")
}

/// Full candidate set for one root domain: the engine's first-level output
/// plus a second pass over every first-level candidate that is neither the
/// seed itself nor a plain TLD swap. Re-fuzzing the seed would recurse;
/// re-fuzzing TLD swaps multiplies the candidate space without surfacing new
/// registrations. Duplicates are left in place for the dedup stage.
pub async fn expand_root<E: FuzzEngine>(
    engine: &E,
    root_domain: &str,
) -> Result<Vec<PermutationCandidate>> {
    let first = engine.generate(root_domain).await?;
    let mut combined = first.clone();
    for candidate in &first {
        if candidate.is_original() || candidate.is_tld_swap() {
            continue;
        }
        combined.extend(engine.generate(&candidate.domain).await?);
    }
    Ok(combined)
}
