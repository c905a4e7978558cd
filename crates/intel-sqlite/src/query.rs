use crate::{Db, OrgId, Organization, PermutationRow, RootDomain, SubDomainId};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

impl Db {
    pub fn organizations(&self) -> Result<Vec<Organization>> {
        let mut stmt = self
            .conn
            .prepare("SELECT org_id, name FROM organizations ORDER BY name")?;
        let rows = stmt.query_map([], |r| {
            Ok(Organization { org_id: r.get(0)?, name: r.get(1)? })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn organization_by_name(&self, name: &str) -> Result<Option<Organization>> {
        let org = self
            .conn
            .query_row(
                "SELECT org_id, name FROM organizations WHERE name=?",
                params![name],
                |r| Ok(Organization { org_id: r.get(0)?, name: r.get(1)? }),
            )
            .optional()?;
        Ok(org)
    }

    pub fn root_domains(&self, org_id: OrgId) -> Result<Vec<RootDomain>> {
        let mut stmt = self.conn.prepare(
            "SELECT root_domain_id, org_id, root_domain FROM root_domains WHERE org_id=? ORDER BY root_domain_id",
        )?;
        let rows = stmt.query_map(params![org_id], |r| {
            Ok(RootDomain { root_domain_id: r.get(0)?, org_id: r.get(1)?, root_domain: r.get(2)? })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Explicit lookup: absence is a normal outcome, not an error.
    pub fn sub_domain_id(&self, org_id: OrgId, sub_domain: &str) -> Result<Option<SubDomainId>> {
        let id = self
            .conn
            .query_row(
                "SELECT sub_domain_id FROM sub_domains WHERE org_id=? AND sub_domain=?",
                params![org_id, sub_domain],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn permutations(&self, org_id: OrgId) -> Result<Vec<PermutationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT org_id, data_source_id, sub_domain_id, domain_permutation,
                    ipv4, ipv6, mail_server, name_server, fuzzer, date_active,
                    ssdeep_score, malicious, blocklist_attack_count,
                    blocklist_report_count, threat_feed_record_count,
                    threat_feed_attack_count
             FROM domain_permutations WHERE org_id=? ORDER BY domain_permutation",
        )?;
        let rows = stmt.query_map(params![org_id], permutation_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn permutation_count(&self, org_id: OrgId) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(1) FROM domain_permutations WHERE org_id=?",
            params![org_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

fn permutation_from_row(r: &Row<'_>) -> rusqlite::Result<PermutationRow> {
    Ok(PermutationRow {
        org_id: r.get(0)?,
        data_source_id: r.get(1)?,
        sub_domain_id: r.get(2)?,
        domain_permutation: r.get(3)?,
        ipv4: r.get(4)?,
        ipv6: r.get(5)?,
        mail_server: r.get(6)?,
        name_server: r.get(7)?,
        fuzzer: r.get(8)?,
        date_active: r.get(9)?,
        ssdeep_score: r.get(10)?,
        malicious: r.get(11)?,
        blocklist_attack_count: r.get(12)?,
        blocklist_report_count: r.get(13)?,
        threat_feed_record_count: r.get(14)?,
        threat_feed_attack_count: r.get(15)?,
    })
}
