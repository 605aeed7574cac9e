use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;
use uuid::Uuid;

pub use meek_stv::CandidateId;

pub type ElectionId = u64;
pub type BallotId = u64;

// ********* Elections ***********

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
    Draft,
    Open,
    Closed,
    Tallied,
    Deleted,
}

impl ElectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionStatus::Draft => "draft",
            ElectionStatus::Open => "open",
            ElectionStatus::Closed => "closed",
            ElectionStatus::Tallied => "tallied",
            ElectionStatus::Deleted => "deleted",
        }
    }
}

impl Display for ElectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct Election {
    pub id: ElectionId,
    pub name: String,
    pub description: String,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
    pub number_of_seats: u32,
    /// Minimum turnout, in percent of the eligible voters. 0 disables the quorum.
    pub quorum: u32,
    pub status: ElectionStatus,
    pub tally_result: Option<JSValue>,
    pub eligible_group_cn: Option<String>,
}

/// The editable settings of an election, used when creating or updating a draft.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ElectionDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "startDatetime")]
    pub start_datetime: DateTime<Utc>,
    #[serde(rename = "endDatetime")]
    pub end_datetime: DateTime<Utc>,
    #[serde(rename = "numberOfSeats")]
    pub number_of_seats: u32,
    #[serde(default)]
    pub quorum: u32,
    #[serde(rename = "eligibleGroupCn")]
    pub eligible_group_cn: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CandidateRecord {
    pub id: CandidateId,
    pub election_id: ElectionId,
    pub freeipa_username: String,
    pub nominated_by: String,
    pub description: String,
    /// Fixed at creation, never changed afterwards.
    pub tiebreak_uuid: Uuid,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ExclusionGroupRecord {
    pub id: u64,
    pub public_id: String,
    pub election_id: ElectionId,
    pub name: String,
    pub max_elected: u32,
    pub candidate_ids: Vec<CandidateId>,
}

// ********* Voting ***********

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct VotingCredential {
    pub id: u64,
    pub election_id: ElectionId,
    /// Opaque identifier given to the voter. Stable for the life of the credential.
    pub public_id: String,
    /// Cleared when the election closes.
    pub freeipa_username: Option<String>,
    pub weight: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BallotRecord {
    pub id: BallotId,
    pub election_id: ElectionId,
    pub credential_public_id: String,
    pub ranking: Vec<CandidateId>,
    /// Copied from the credential at submission time.
    pub weight: u64,
    /// Never exported.
    pub nonce: String,
    pub ballot_hash: String,
    pub previous_chain_hash: String,
    pub chain_hash: String,
    pub superseded_by: Option<BallotId>,
    pub created_at: DateTime<Utc>,
}

impl BallotRecord {
    pub fn is_counted(&self) -> bool {
        self.superseded_by.is_none()
    }
}

/// What the voter receives after submitting a ballot.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct BallotReceipt {
    pub ballot_id: BallotId,
    pub ballot_hash: String,
    pub nonce: String,
    pub previous_chain_hash: String,
    pub chain_hash: String,
}

// ********* Audit ***********

pub const EVENT_BALLOT_SUBMITTED: &str = "ballot_submitted";
pub const EVENT_QUORUM_REACHED: &str = "quorum_reached";
pub const EVENT_ELECTION_STARTED: &str = "election_started";
pub const EVENT_ELECTION_END_EXTENDED: &str = "election_end_extended";
pub const EVENT_ELECTION_ANONYMIZED: &str = "election_anonymized";
pub const EVENT_ELECTION_CLOSED: &str = "election_closed";
pub const EVENT_TALLY_ROUND: &str = "tally_round";
pub const EVENT_TALLY_COMPLETED: &str = "tally_completed";

#[derive(PartialEq, Debug, Clone)]
pub struct AuditLogEntry {
    pub id: u64,
    pub election_id: ElectionId,
    pub event_type: String,
    pub payload: JSValue,
    pub is_public: bool,
    pub timestamp: DateTime<Utc>,
}
