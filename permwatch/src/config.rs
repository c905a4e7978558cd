use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RunConfig {
    pub org: Option<String>,
    pub org_concurrency: Option<usize>,
    pub engine: Option<PathBuf>,
    pub tld_dict: Option<PathBuf>,
    pub fuzz_threads: Option<u32>,
    pub engine_timeout_s: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct FeedsConfig {
    pub blocklist_url: Option<String>,
    pub threatfeed_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub qps: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub run: Option<RunConfig>,
    pub feeds: Option<FeedsConfig>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("permwatch.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_config() {
        let cfg: Config = serde_yaml::from_str(
            "run:\n  org_concurrency: 8\nfeeds:\n  qps: 2\n  blocklist_url: http://blocklist.test/api.php\n",
        )
        .unwrap();
        assert_eq!(cfg.run.as_ref().unwrap().org_concurrency, Some(8));
        let feeds = cfg.feeds.unwrap();
        assert_eq!(feeds.qps, Some(2));
        assert_eq!(feeds.blocklist_url.as_deref(), Some("http://blocklist.test/api.php"));
        assert_eq!(feeds.timeout_ms, None);
    }
}
