//! Shared constants and utilities for the permwatch pipeline.

pub mod ratelimiter;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Root-domain placeholder meaning "no real root domain configured".
/// Rows carrying it are skipped outright: no candidate generation, no
/// failure record.
pub const NULL_ROOT: &str = "Null_Root";

/// Address placeholder meaning DNS resolution failed upstream for that
/// record type. No enrichment lookup may be issued for this value.
pub const SERVFAIL: &str = "!ServFail";

/// Name under which the pipeline registers itself in the data-source table.
pub const DATA_SOURCE: &str = "dnstwist";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn sentinels_are_verbatim() {
        // These values arrive as literal strings in upstream data and are
        // matched by equality, never normalized.
        assert_eq!(NULL_ROOT, "Null_Root");
        assert_eq!(SERVFAIL, "!ServFail");
    }
}
