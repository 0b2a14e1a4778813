//! Core domain types for GRAF (Grant Registry Acquisition Framework).

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of this crate, used as a stable identifier in diagnostics.
pub const CRATE_NAME: &str = "graf-core";

/// The CrossRef grant-metadata ontology: the fixed set of target fields that
/// source columns are aligned onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OntologyField {
    GrantId,
    Doi,
    Resource,
    ProjectTitle,
    ProjectDescription,
    FunderName,
    FunderId,
    FundingType,
    FundingScheme,
    InternalAwardNumber,
    StartDate,
    EndDate,
    Amount,
    Currency,
    FundingPercentage,
    OrganizationId,
    OrganizationName,
    Ror,
    CountryCode,
    InvestigatorId,
    InvestigatorRole,
    InvestigatorGivenName,
    InvestigatorFamilyName,
    InvestigatorOrcid,
}

impl OntologyField {
    pub const ALL: [OntologyField; 24] = [
        OntologyField::GrantId,
        OntologyField::Doi,
        OntologyField::Resource,
        OntologyField::ProjectTitle,
        OntologyField::ProjectDescription,
        OntologyField::FunderName,
        OntologyField::FunderId,
        OntologyField::FundingType,
        OntologyField::FundingScheme,
        OntologyField::InternalAwardNumber,
        OntologyField::StartDate,
        OntologyField::EndDate,
        OntologyField::Amount,
        OntologyField::Currency,
        OntologyField::FundingPercentage,
        OntologyField::OrganizationId,
        OntologyField::OrganizationName,
        OntologyField::Ror,
        OntologyField::CountryCode,
        OntologyField::InvestigatorId,
        OntologyField::InvestigatorRole,
        OntologyField::InvestigatorGivenName,
        OntologyField::InvestigatorFamilyName,
        OntologyField::InvestigatorOrcid,
    ];

    /// Field name as it appears in mapping files and prompts. Names are
    /// case-sensitive; `DOI`, `ROR` and `investigator_ORCID` keep their
    /// upstream capitalization.
    pub fn name(&self) -> &'static str {
        match self {
            OntologyField::GrantId => "grant_id",
            OntologyField::Doi => "DOI",
            OntologyField::Resource => "resource",
            OntologyField::ProjectTitle => "project_title",
            OntologyField::ProjectDescription => "project_description",
            OntologyField::FunderName => "funder_name",
            OntologyField::FunderId => "funder_id",
            OntologyField::FundingType => "funding_type",
            OntologyField::FundingScheme => "funding_scheme",
            OntologyField::InternalAwardNumber => "internal_award_number",
            OntologyField::StartDate => "start_date",
            OntologyField::EndDate => "end_date",
            OntologyField::Amount => "amount",
            OntologyField::Currency => "currency",
            OntologyField::FundingPercentage => "funding_percentage",
            OntologyField::OrganizationId => "organization_id",
            OntologyField::OrganizationName => "organization_name",
            OntologyField::Ror => "ROR",
            OntologyField::CountryCode => "country_code",
            OntologyField::InvestigatorId => "investigator_id",
            OntologyField::InvestigatorRole => "investigator_role",
            OntologyField::InvestigatorGivenName => "investigator_given_name",
            OntologyField::InvestigatorFamilyName => "investigator_family_name",
            OntologyField::InvestigatorOrcid => "investigator_ORCID",
        }
    }

    /// Case-sensitive lookup by field name.
    pub fn parse(name: &str) -> Option<OntologyField> {
        OntologyField::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            OntologyField::GrantId => "Funder-supplied grant/award ID",
            OntologyField::Doi => "DOI being registered",
            OntologyField::Resource => "URL of the grant landing page",
            OntologyField::ProjectTitle => "Can store multiple titles in different languages",
            OntologyField::ProjectDescription => "Project abstract/description",
            OntologyField::FunderName => "Name of the funder",
            OntologyField::FunderId => "Funder registry ID",
            OntologyField::FundingType => "Type of funding (grant, award, contract, etc.)",
            OntologyField::FundingScheme => "Scheme for grant/award (instrument, call name, etc.)",
            OntologyField::InternalAwardNumber => "Internal grant/award number",
            OntologyField::StartDate => "Planned start date",
            OntologyField::EndDate => "Planned end date",
            OntologyField::Amount => "Funding amount",
            OntologyField::Currency => "ISO 4217 currency code",
            OntologyField::FundingPercentage => "% of total funding",
            OntologyField::OrganizationId => "Unique ID for the organization",
            OntologyField::OrganizationName => "Name of the organization",
            OntologyField::Ror => "ROR ID for institution disambiguation",
            OntologyField::CountryCode => "ISO 3166-1 alpha-2 country code",
            OntologyField::InvestigatorId => "Unique ID for investigator",
            OntologyField::InvestigatorRole => "Role (lead_investigator, co-lead, investigator)",
            OntologyField::InvestigatorGivenName => "First name",
            OntologyField::InvestigatorFamilyName => "Last name",
            OntologyField::InvestigatorOrcid => "ORCID ID (as URL)",
        }
    }

    /// Cardinality or format constraint, rendered after the description in
    /// alignment prompts.
    pub fn constraints(&self) -> &'static str {
        match self {
            OntologyField::GrantId => "one per grant",
            OntologyField::Doi => "one per grant",
            OntologyField::Resource => "URL",
            OntologyField::ProjectTitle => "repeatable, one per language",
            OntologyField::ProjectDescription => "repeatable, one per language",
            OntologyField::FunderName => "one per funding entry",
            OntologyField::FunderId => "Funder Registry DOI",
            OntologyField::FundingType => "controlled vocabulary",
            OntologyField::FundingScheme => "free text",
            OntologyField::InternalAwardNumber => "free text",
            OntologyField::StartDate => "ISO 8601 date",
            OntologyField::EndDate => "ISO 8601 date",
            OntologyField::Amount => "numeric",
            OntologyField::Currency => "ISO 4217 code",
            OntologyField::FundingPercentage => "0-100",
            OntologyField::OrganizationId => "one per organization",
            OntologyField::OrganizationName => "one per organization",
            OntologyField::Ror => "ROR ID URL",
            OntologyField::CountryCode => "ISO 3166-1 alpha-2",
            OntologyField::InvestigatorId => "one per person",
            OntologyField::InvestigatorRole => {
                "lead_investigator, co_lead_investigator, or investigator"
            }
            OntologyField::InvestigatorGivenName => "free text",
            OntologyField::InvestigatorFamilyName => "free text",
            OntologyField::InvestigatorOrcid => "ORCID URL",
        }
    }
}

/// Freshness record written as `last_download.json` next to the timestamped
/// fetch directories of a source (or source action).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRecord {
    pub timestamp: DateTime<Utc>,
    /// Basename of the timestamped fetch directory the record points at.
    pub directory: String,
    pub source_id: String,
    pub status: String,
    pub action: Option<String>,
}

impl DownloadRecord {
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_seconds() as f64 / 86_400.0
    }
}

/// Provenance metadata written as `metadata.json` inside every fetch
/// directory. The optional tail varies by source format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchDirMetadata {
    pub source_id: String,
    pub funder: String,
    pub source_name: String,
    pub country: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub format: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_verification: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_processed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_processed: Option<bool>,
}

impl FetchDirMetadata {
    pub fn new(
        source_id: impl Into<String>,
        funder: impl Into<String>,
        source_name: impl Into<String>,
        country: impl Into<String>,
        kind: impl Into<String>,
        format: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        FetchDirMetadata {
            source_id: source_id.into(),
            funder: funder.into(),
            source_name: source_name.into(),
            country: country.into(),
            kind: kind.into(),
            status: "Downloaded".to_string(),
            format: format.into(),
            timestamp,
            action: None,
            download_url: None,
            file_size_bytes: None,
            ssl_verification: None,
            verification_passed: None,
            api_url: None,
            record_count: None,
            pages_processed: None,
            scrape_url: None,
            html_size_bytes: None,
            llm_processed: None,
        }
    }
}

/// A persisted column alignment for one source and one column set.
///
/// `columns` keeps the source file's original column order; `mapping` values
/// are ontology field names, or the literal string `"null"` for columns with
/// no counterpart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMapping {
    pub source: String,
    pub columns: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub mapping: BTreeMap<String, String>,
}

impl ColumnMapping {
    /// Ontology field a source column maps onto, if any. `"null"` targets and
    /// unknown field names resolve to `None`.
    pub fn mapped_field(&self, column: &str) -> Option<OntologyField> {
        let target = self.mapping.get(column)?;
        if target == "null" {
            return None;
        }
        OntologyField::parse(target)
    }
}

/// Immutable runtime configuration, built once from the environment and
/// passed by reference into the pipelines.
#[derive(Debug, Clone)]
pub struct GrafConfig {
    pub raw_data_dir: PathBuf,
    pub mappings_dir: PathBuf,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_retries: u32,
}

impl GrafConfig {
    pub fn from_env() -> Self {
        let raw_data_dir = std::env::var("GRAF_RAW_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/raw"));
        let mappings_dir = std::env::var("GRAF_MAPPINGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./ontology/mappings"));
        let sources_file = std::env::var("GRAF_SOURCES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sources.yaml"));
        let user_agent = std::env::var("GRAF_USER_AGENT")
            .unwrap_or_else(|_| "graf-bot/0.1 (+https://example.org/graf)".to_string());
        let http_timeout_secs = std::env::var("GRAF_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let http_retries = std::env::var("GRAF_HTTP_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        GrafConfig {
            raw_data_dir,
            mappings_dir,
            sources_file,
            user_agent,
            http_timeout_secs,
            http_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ontology_names_round_trip() {
        for field in OntologyField::ALL {
            assert_eq!(OntologyField::parse(field.name()), Some(field));
        }
    }

    #[test]
    fn ontology_lookup_is_case_sensitive() {
        assert_eq!(OntologyField::parse("DOI"), Some(OntologyField::Doi));
        assert_eq!(OntologyField::parse("doi"), None);
        assert_eq!(
            OntologyField::parse("investigator_ORCID"),
            Some(OntologyField::InvestigatorOrcid)
        );
        assert_eq!(OntologyField::parse("investigator_orcid"), None);
    }

    #[test]
    fn download_record_age_in_days() {
        let now = Utc::now();
        let record = DownloadRecord {
            timestamp: now - Duration::hours(36),
            directory: "20250101_120000".to_string(),
            source_id: "demo".to_string(),
            status: "success".to_string(),
            action: None,
        };
        let age = record.age_days(now);
        assert!((age - 1.5).abs() < 1e-6, "age was {age}");
    }

    #[test]
    fn mapped_field_skips_null_and_unknown_targets() {
        let mut mapping = BTreeMap::new();
        mapping.insert("Titulo".to_string(), "project_title".to_string());
        mapping.insert("Notas".to_string(), "null".to_string());
        mapping.insert("Extra".to_string(), "no_such_field".to_string());
        let saved = ColumnMapping {
            source: "demo".to_string(),
            columns: vec!["Titulo".into(), "Notas".into(), "Extra".into()],
            timestamp: Utc::now(),
            mapping,
        };
        assert_eq!(
            saved.mapped_field("Titulo"),
            Some(OntologyField::ProjectTitle)
        );
        assert_eq!(saved.mapped_field("Notas"), None);
        assert_eq!(saved.mapped_field("Extra"), None);
        assert_eq!(saved.mapped_field("Missing"), None);
    }
}
