pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE data_sources (
  data_source_id  INTEGER PRIMARY KEY AUTOINCREMENT,
  name            TEXT NOT NULL UNIQUE,
  last_run        TEXT
);

CREATE TABLE organizations (
  org_id          INTEGER PRIMARY KEY AUTOINCREMENT,
  name            TEXT NOT NULL UNIQUE
);

CREATE TABLE root_domains (
  root_domain_id  INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id          INTEGER NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
  root_domain     TEXT NOT NULL,
  UNIQUE (org_id, root_domain)
);

CREATE TABLE sub_domains (
  sub_domain_id   INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id          INTEGER NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
  sub_domain      TEXT NOT NULL,
  data_source_id  INTEGER NOT NULL REFERENCES data_sources(data_source_id),
  UNIQUE (org_id, sub_domain)
);

CREATE TABLE domain_permutations (
  perm_id                  INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id                   INTEGER NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
  data_source_id           INTEGER NOT NULL REFERENCES data_sources(data_source_id),
  sub_domain_id            INTEGER NOT NULL REFERENCES sub_domains(sub_domain_id),
  domain_permutation       TEXT NOT NULL,
  ipv4                     TEXT NOT NULL,
  ipv6                     TEXT NOT NULL,
  mail_server              TEXT NOT NULL,
  name_server              TEXT NOT NULL,
  fuzzer                   TEXT NOT NULL,
  date_active              TEXT NOT NULL,
  ssdeep_score             TEXT NOT NULL,
  malicious                INTEGER NOT NULL CHECK (malicious IN (0,1)),
  blocklist_attack_count   INTEGER NOT NULL DEFAULT 0,
  blocklist_report_count   INTEGER NOT NULL DEFAULT 0,
  threat_feed_record_count INTEGER NOT NULL DEFAULT 0,
  threat_feed_attack_count INTEGER NOT NULL DEFAULT 0,
  UNIQUE (org_id, domain_permutation)
);

CREATE TABLE runs (
  run_id          TEXT PRIMARY KEY,
  started_at_ms   INTEGER NOT NULL,
  finished_at_ms  INTEGER,
  org_count       INTEGER DEFAULT 0,
  row_count       INTEGER DEFAULT 0,
  failure_count   INTEGER DEFAULT 0
);

CREATE TABLE run_failures (
  failure_id      INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id          TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  organization    TEXT NOT NULL,
  root_domain     TEXT,
  stage           TEXT NOT NULL,
  message         TEXT NOT NULL,
  at_ms           INTEGER NOT NULL
);

CREATE INDEX idx_root_domains_org ON root_domains(org_id);
CREATE INDEX idx_sub_domains_org ON sub_domains(org_id);
CREATE INDEX idx_perms_org ON domain_permutations(org_id);
CREATE INDEX idx_perms_malicious ON domain_permutations(org_id, malicious);
CREATE INDEX idx_failures_run ON run_failures(run_id);

COMMIT;
"#;
