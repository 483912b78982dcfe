//! Core domain model for the campaign finance backfill.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Filer-type label the regulator puts on candidate name records.
pub const FILER_TYPE_CANDIDATE: &str = "CANDIDATE/OFFICEHOLDER";
/// Filer-type label the regulator puts on recipient-committee name records.
pub const FILER_TYPE_RECIPIENT_COMMITTEE: &str = "RECIPIENT COMMITTEE";
/// Link-type code for a candidate-controls-committee relationship. The raw
/// link table does not say which side is the candidate.
pub const LINK_TYPE_CANDIDATE_COMMITTEE: &str = "12011";
/// Periodic disclosure forms. A filing of either marks a committee as active.
pub const DISCLOSURE_FORMS: [&str; 2] = ["F460", "F450"];

/// One row of the raw filer-name table. Many rows share a `filer_id`; the
/// row with the greatest `record_id` is the authoritative one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFilerName {
    pub filer_id: i64,
    pub record_id: i64,
    pub filer_type: String,
    pub status: Option<String>,
    pub effective_date: Option<NaiveDate>,
    pub xref_filer_id: Option<String>,
    pub title: String,
    pub first: String,
    pub last: String,
    pub suffix: String,
}

/// One row of the raw filer-type table, carrying the party assignment.
/// Grouped by `filer_id` independently of the name table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFilerType {
    pub filer_id: i64,
    pub record_id: i64,
    pub party: Option<String>,
}

/// An unordered filer-to-filer link. Either side may be null in the export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLink {
    pub filer_id_a: Option<i64>,
    pub filer_id_b: Option<i64>,
    pub link_type: String,
}

/// A filing-header row, reduced to the fields activity detection needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFiling {
    pub filer_id: i64,
    pub form_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilerType {
    Candidate,
    Pac,
}

impl FilerType {
    pub fn as_str(self) -> &'static str {
        match self {
            FilerType::Candidate => "cand",
            FilerType::Pac => "pac",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value {
            "cand" => Some(FilerType::Candidate),
            "pac" => Some(FilerType::Pac),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitteeType {
    Candidate,
    Pac,
    /// Committee linked to other committees rather than a candidate. Part of
    /// the regulator's taxonomy; the loader itself never produces it.
    LinkedPac,
}

impl CommitteeType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitteeType::Candidate => "cand",
            CommitteeType::Pac => "pac",
            CommitteeType::LinkedPac => "linked-pac",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value {
            "cand" => Some(CommitteeType::Candidate),
            "pac" => Some(CommitteeType::Pac),
            "linked-pac" => Some(CommitteeType::LinkedPac),
            _ => None,
        }
    }
}

/// An entity that files disclosure documents: a candidate with committees
/// raising money on their behalf, or a PAC contributing to many candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filer {
    pub id: i64,
    pub filer_id_raw: i64,
    pub status: Option<String>,
    pub effective_date: Option<NaiveDate>,
    pub xref_filer_id: Option<String>,
    pub filer_type: FilerType,
    pub name: String,
    pub party: Option<String>,
}

/// A fundraising committee. For a candidate-controlled committee `filer_id`
/// points at the candidate's [`Filer`] row, not at a committee filer; the
/// committee's own raw id stays reachable through `filer_id_raw`. A PAC
/// committee owns itself through its matching PAC filer row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    pub id: i64,
    pub filer_id: i64,
    pub filer_id_raw: i64,
    pub xref_filer_id: Option<String>,
    pub name: String,
    pub committee_type: CommitteeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    pub id: i64,
    pub year: i32,
    pub kind: String,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposition {
    pub id: i64,
    pub name: String,
    pub external_id: String,
    pub election_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Position {
    Support,
    Oppose,
}

impl Position {
    pub fn as_str(self) -> &'static str {
        match self {
            Position::Support => "SUPPORT",
            Position::Oppose => "OPPOSE",
        }
    }
}

/// Scraped election block: one dated election table on a measures page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedElection {
    pub date: NaiveDate,
    pub kind: String,
    pub propositions: Vec<ScrapedProposition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedProposition {
    pub external_id: String,
    pub name: String,
    pub committees: Vec<ScrapedCommitteeRef>,
}

/// A committee as it appears under a measure. `external_id` is ambiguous:
/// it may be a raw filer id or a cross-reference id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedCommitteeRef {
    pub name: String,
    pub external_id: String,
    pub supports: bool,
}

/// Assemble a display name from the four raw name parts. Empty parts leave
/// doubled spaces behind, so internal whitespace runs collapse to one space.
pub fn assemble_name(title: &str, first: &str, last: &str, suffix: &str) -> String {
    [title, first, last, suffix]
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonicalize the free-text election type scraped off the measures site.
/// Runoff labels are checked before plain specials so they don't collapse.
pub fn normalize_election_kind(raw_label: &str) -> String {
    let upper = raw_label.trim().to_ascii_uppercase();
    for canonical in ["SPECIAL RUNOFF", "SPECIAL", "PRIMARY", "GENERAL", "RECALL"] {
        if upper.contains(canonical) {
            return canonical.to_string();
        }
    }
    upper
}
