use meek_stv::TallyError;
use snafu::prelude::*;

pub mod ballots;
pub mod config_reader;
pub mod credentials;
pub mod export;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod notifications;
pub mod runner;
pub mod store;

pub use crate::elections::model::*;

/// Why a credential was refused. Only used to pick the status code, the
/// message is the same in both cases.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CredentialProblem {
    NotFound,
    OwnedByAnotherVoter,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ElectionError {
    #[snafu(display("Invalid credential"))]
    InvalidCredential { reason: CredentialProblem },

    #[snafu(display("Election {election_id} is not open"))]
    ElectionNotOpen { election_id: ElectionId },

    #[snafu(display("Cannot {action}: election {election_id} is {status}"))]
    ElectionState {
        election_id: ElectionId,
        action: String,
        status: ElectionStatus,
    },

    #[snafu(display("Ballot chain of election {election_id} is broken at position {position}: {detail}"))]
    ChainIntegrity {
        election_id: ElectionId,
        position: usize,
        detail: String,
    },

    #[snafu(display("The tally did not converge"))]
    TallyNonConvergence { source: TallyError },

    #[snafu(display("The tally configuration was rejected"))]
    Tally { source: TallyError },

    #[snafu(display("Invalid ranking: {message}"))]
    InvalidRanking { message: String },

    #[snafu(display("Voter is not eligible to vote in election {election_id}"))]
    VoterIneligible { election_id: ElectionId },

    #[snafu(display("{message}"))]
    Validation { message: String },

    #[snafu(display("Election {election_id} not found"))]
    ElectionNotFound { election_id: ElectionId },

    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Error reading JSON"))]
    ParsingJson { source: serde_json::Error },

    #[snafu(display("Error writing {path}"))]
    WritingOutput {
        source: std::io::Error,
        path: String,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type ElectionResult<T> = Result<T, ElectionError>;

impl ElectionError {
    /// Stable category of the error, safe to show to users.
    pub fn code(&self) -> &'static str {
        match self {
            ElectionError::InvalidCredential { .. } => "invalid_credential",
            ElectionError::ElectionNotOpen { .. } => "election_not_open",
            ElectionError::ElectionState { .. } => "election_state",
            ElectionError::ChainIntegrity { .. } => "chain_integrity_failure",
            ElectionError::TallyNonConvergence { .. } => "tally_non_convergence",
            ElectionError::Tally { .. } => "tally_rejected",
            ElectionError::InvalidRanking { .. } => "invalid_ranking",
            ElectionError::VoterIneligible { .. } => "voter_ineligible",
            ElectionError::Validation { .. } => "validation",
            ElectionError::ElectionNotFound { .. } => "election_not_found",
            ElectionError::OpeningJson { .. } | ElectionError::ParsingJson { .. } => "input",
            ElectionError::WritingOutput { .. } => "output",
            ElectionError::Whatever { .. } => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ElectionError::InvalidCredential {
                reason: CredentialProblem::NotFound,
            } => 400,
            ElectionError::InvalidCredential {
                reason: CredentialProblem::OwnedByAnotherVoter,
            } => 403,
            ElectionError::VoterIneligible { .. } => 403,
            ElectionError::ElectionNotOpen { .. }
            | ElectionError::InvalidRanking { .. }
            | ElectionError::Validation { .. }
            | ElectionError::Tally { .. } => 400,
            ElectionError::ElectionNotFound { .. } => 404,
            ElectionError::ElectionState { .. } => 409,
            ElectionError::ChainIntegrity { .. }
            | ElectionError::TallyNonConvergence { .. }
            | ElectionError::OpeningJson { .. }
            | ElectionError::ParsingJson { .. }
            | ElectionError::WritingOutput { .. }
            | ElectionError::Whatever { .. } => 500,
        }
    }
}

impl From<TallyError> for ElectionError {
    fn from(e: TallyError) -> Self {
        match e {
            TallyError::NoConvergence { .. } => ElectionError::TallyNonConvergence { source: e },
            _ => ElectionError::Tally { source: e },
        }
    }
}
