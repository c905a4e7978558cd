use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type OrgId = i64;
pub type RootDomainId = i64;
pub type SubDomainId = i64;
pub type DataSourceId = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: OrgId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootDomain {
    pub root_domain_id: RootDomainId,
    pub org_id: OrgId,
    pub root_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubDomain {
    pub sub_domain_id: SubDomainId,
    pub org_id: OrgId,
    pub sub_domain: String,
    pub data_source_id: DataSourceId,
}

/// One classified permutation, shaped for the bulk upsert. Text columns are
/// never NULL: record values that were absent upstream are stored as empty
/// strings so every row has the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationRow {
    pub org_id: OrgId,
    pub data_source_id: DataSourceId,
    pub sub_domain_id: SubDomainId,
    pub domain_permutation: String,
    pub ipv4: String,
    pub ipv6: String,
    pub mail_server: String,
    pub name_server: String,
    pub fuzzer: String,
    pub date_active: String,
    pub ssdeep_score: String,
    pub malicious: bool,
    pub blocklist_attack_count: i64,
    pub blocklist_report_count: i64,
    pub threat_feed_record_count: i64,
    pub threat_feed_attack_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub organization: String,
    pub root_domain: Option<String>,
    pub stage: String,
    pub message: String,
    pub at_ms: i64,
}
