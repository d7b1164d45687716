//! Shared enums and identifiers used across every component.
//!
//! Kept in one leaf module because `contract`, `identity`, `evidence_index`,
//! `needset`, `consensus`, and `round` all need the same vocabulary and none
//! of them should own it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source-credibility class. 1 = manufacturer, 4 = forum/user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tier(pub u8);

impl Tier {
    pub const MANUFACTURER: Tier = Tier(1);
    pub const LAB_REVIEW: Tier = Tier(2);
    pub const RETAIL: Tier = Tier(3);
    pub const FORUM: Tier = Tier(4);

    /// Clamp an arbitrary integer into the valid 1..=4 range.
    pub fn clamp(raw: u8) -> Self {
        Tier(raw.clamp(1, 4))
    }

    pub fn is_valid(self) -> bool {
        (1..=4).contains(&self.0)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Spec,
    Manual,
    Support,
    Review,
    Teardown,
    Retail,
    Forum,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    HtmlSpecTable,
    EmbeddedJson,
    StructuredMetadata,
    ArticleText,
    PdfText,
    PdfOcr,
    ImageOcr,
    Adapter,
    LlmExtract,
    DeterministicNormalizer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMatchLevel {
    Unlocked,
    Provisional,
    Locked,
    Conflict,
}

impl IdentityMatchLevel {
    /// Cap on effective confidence implied by this identity state (§4.2).
    pub fn confidence_cap(self) -> f64 {
        match self {
            IdentityMatchLevel::Locked => 1.00,
            IdentityMatchLevel::Provisional => 0.74,
            IdentityMatchLevel::Unlocked => 0.59,
            IdentityMatchLevel::Conflict => 0.39,
        }
    }

    /// Identity weight used by the consensus engine (§4.10). `failed` has no
    /// corresponding lock state, so it is modeled on the evidence unit instead
    /// (see [`crate::consensus::identity_weight`]).
    pub fn identity_weight(self) -> f64 {
        match self {
            IdentityMatchLevel::Locked => 1.0,
            IdentityMatchLevel::Provisional => 0.74,
            IdentityMatchLevel::Unlocked => 0.59,
            IdentityMatchLevel::Conflict => 0.39,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityLevel {
    Easy,
    Medium,
    Hard,
    VeryHard,
}

impl AmbiguityLevel {
    pub fn is_hard_or_worse(self) -> bool {
        matches!(self, AmbiguityLevel::Hard | AmbiguityLevel::VeryHard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredLevel {
    Identity,
    Critical,
    Required,
    Optional,
}

impl RequiredLevel {
    /// `required_weight(f)` from §4.2.
    pub fn weight(self) -> f64 {
        match self {
            RequiredLevel::Identity => 5.0,
            RequiredLevel::Critical => 4.0,
            RequiredLevel::Required => 2.0,
            RequiredLevel::Optional => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Unknown,
    Candidate,
    Accepted,
    Conflict,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    MissingEvidence,
    Conflict,
    IdentityUncertain,
    BlockedByPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedReason {
    Missing,
    LowConf,
    TierDeficit,
    MinRefsFail,
    Conflict,
    IdentityUnlocked,
    BlockedByIdentity,
    PublishGateBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStopReason {
    Complete,
    MaxRoundsReached,
    BudgetExhausted,
    NoProgress,
    RepeatedLowQuality,
    IdentityGateStuck,
    EscalationExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Http,
    Headless,
    AltCrawler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocHint {
    ManualPdf,
    SpecPdf,
    Support,
    LabReview,
    TeardownReview,
    Retail,
    General,
}

/// A pure function of content + offsets + parser/chunker versions (invariant 2, §3).
pub type SnippetId = String;
pub type ContentHash = String;
pub type DocId = String;
pub type SourceId = String;
pub type FactId = String;
pub type RunId = String;
pub type JobId = String;
pub type FieldKey = String;
