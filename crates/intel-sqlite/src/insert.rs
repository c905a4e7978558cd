use crate::{DataSourceId, Db, OrgId, PermutationRow, RootDomainId, RunFailure, RunMeta, SubDomainId};
use anyhow::{anyhow, Result};
use rusqlite::params;
use uuid::Uuid;

impl Db {
    pub fn begin_run(&self, meta: &RunMeta) -> Result<()> {
        self.conn.execute(
            "INSERT INTO runs(run_id, started_at_ms) VALUES (?,?)",
            params![meta.run_id.to_string(), meta.started_at_ms],
        )?;
        Ok(())
    }

    pub fn finish_run(
        &self,
        run_id: &Uuid,
        finished_at_ms: i64,
        org_count: i64,
        row_count: i64,
        failure_count: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET finished_at_ms=?, org_count=?, row_count=?, failure_count=? WHERE run_id=?",
            params![finished_at_ms, org_count, row_count, failure_count, run_id.to_string()],
        )?;
        Ok(())
    }

    pub fn add_run_failure(&self, run_id: &Uuid, failure: &RunFailure) -> Result<()> {
        self.conn.execute(
            "INSERT INTO run_failures(run_id, organization, root_domain, stage, message, at_ms) VALUES (?,?,?,?,?,?)",
            params![
                run_id.to_string(),
                failure.organization,
                failure.root_domain,
                failure.stage,
                failure.message,
                failure.at_ms
            ],
        )?;
        Ok(())
    }

    /// Get-or-create a data source by name. Safe to call on every run.
    pub fn ensure_data_source(&self, name: &str) -> Result<DataSourceId> {
        self.conn.execute(
            "INSERT INTO data_sources(name) VALUES (?) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let id: DataSourceId = self.conn.query_row(
            "SELECT data_source_id FROM data_sources WHERE name=?",
            params![name],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn touch_data_source(&self, id: DataSourceId, last_run: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE data_sources SET last_run=? WHERE data_source_id=?",
            params![last_run, id],
        )?;
        Ok(())
    }

    pub fn ensure_organization(&self, name: &str) -> Result<OrgId> {
        self.conn.execute(
            "INSERT INTO organizations(name) VALUES (?) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let id: OrgId = self.conn.query_row(
            "SELECT org_id FROM organizations WHERE name=?",
            params![name],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn ensure_root_domain(&self, org_id: OrgId, root_domain: &str) -> Result<RootDomainId> {
        self.conn.execute(
            "INSERT INTO root_domains(org_id, root_domain) VALUES (?,?) ON CONFLICT(org_id, root_domain) DO NOTHING",
            params![org_id, root_domain],
        )?;
        let id: RootDomainId = self.conn.query_row(
            "SELECT root_domain_id FROM root_domains WHERE org_id=? AND root_domain=?",
            params![org_id, root_domain],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Get-or-create the subdomain identity for a root domain. Lookup first,
    /// create on miss, look up again: a lost duplicate-insert race lands on
    /// the row the winner created, never on a second live row.
    pub fn ensure_sub_domain(
        &self,
        org_id: OrgId,
        sub_domain: &str,
        data_source_id: DataSourceId,
    ) -> Result<SubDomainId> {
        if let Some(id) = self.sub_domain_id(org_id, sub_domain)? {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO sub_domains(org_id, sub_domain, data_source_id) VALUES (?,?,?)
             ON CONFLICT(org_id, sub_domain) DO NOTHING",
            params![org_id, sub_domain, data_source_id],
        )?;
        self.sub_domain_id(org_id, sub_domain)?
            .ok_or_else(|| anyhow!("sub_domain row missing after insert: {}", sub_domain))
    }

    /// Bulk upsert keyed on (org_id, domain_permutation). Conflicts overwrite
    /// the verdict, the four counts, the data source, and the active date;
    /// identity columns are insert-only. The whole batch commits in one
    /// transaction.
    pub fn upsert_permutations(&self, rows: &[PermutationRow]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO domain_permutations(
                    org_id, data_source_id, sub_domain_id, domain_permutation,
                    ipv4, ipv6, mail_server, name_server, fuzzer, date_active,
                    ssdeep_score, malicious, blocklist_attack_count,
                    blocklist_report_count, threat_feed_record_count,
                    threat_feed_attack_count)
                 VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
                 ON CONFLICT(org_id, domain_permutation) DO UPDATE SET
                    malicious = excluded.malicious,
                    blocklist_attack_count = excluded.blocklist_attack_count,
                    blocklist_report_count = excluded.blocklist_report_count,
                    threat_feed_record_count = excluded.threat_feed_record_count,
                    threat_feed_attack_count = excluded.threat_feed_attack_count,
                    data_source_id = excluded.data_source_id,
                    date_active = excluded.date_active",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.org_id,
                    r.data_source_id,
                    r.sub_domain_id,
                    r.domain_permutation,
                    r.ipv4,
                    r.ipv6,
                    r.mail_server,
                    r.name_server,
                    r.fuzzer,
                    r.date_active,
                    r.ssdeep_score,
                    r.malicious,
                    r.blocklist_attack_count,
                    r.blocklist_report_count,
                    r.threat_feed_record_count,
                    r.threat_feed_attack_count
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }
}
