// ********* Input data structures ***********

use std::error::Error;
use std::fmt::Display;

use uuid::Uuid;

use crate::value::VoteValue;

/// Identifier of a candidate, as assigned by the caller.
pub type CandidateId = u64;

/// A candidate standing in the election.
///
/// The `tiebreak_uuid` is the key of last resort for breaking ties. It is
/// expected to be fixed when the candidate is created and never changed.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    pub tiebreak_uuid: Uuid,
}

/// A ranked ballot, with the weight of the credential that cast it.
///
/// The ranking should not contain duplicates. Candidates missing from the
/// ranking receive nothing from this ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Ballot {
    pub ranking: Vec<CandidateId>,
    pub weight: u64,
}

/// At most `max_elected` of `candidate_ids` may be elected, whatever the votes.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ExclusionGroup {
    pub public_id: String,
    pub name: String,
    pub max_elected: u32,
    pub candidate_ids: Vec<CandidateId>,
}

impl ExclusionGroup {
    /// The name shown in public texts. Falls back to the public id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.public_id.trim()
        } else {
            self.name.trim()
        }
    }
}

// ********* Configuration **********

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct TallyRules {
    /// Convergence tolerance for the retention factors and the quota test.
    pub epsilon: VoteValue,
    /// Iteration budget of one fixed-point phase. The budget starts over after
    /// each elimination.
    pub max_iterations: u32,
}

impl TallyRules {
    pub const DEFAULT_EPSILON_DIGITS: u32 = 28;
    pub const DEFAULT_MAX_ITERATIONS: u32 = 200;
}

impl Default for TallyRules {
    fn default() -> Self {
        TallyRules {
            epsilon: VoteValue::ten_to_minus(TallyRules::DEFAULT_EPSILON_DIGITS),
            max_iterations: TallyRules::DEFAULT_MAX_ITERATIONS,
        }
    }
}

// ******** Output data structures *********

/// The rules of the tie-break cascade, in the order they are applied.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum TieBreakRule {
    /// Retained total at the end of the previous iteration.
    PriorRoundPerformance,
    /// Total weight offered to the candidate in the current distribution.
    CumulativeSupport,
    /// Weight of the ballots ranking the candidate first.
    FirstPreferences,
    /// The fixed tie-break identifier of the candidate.
    CandidateOrderingIdentifier,
}

impl TieBreakRule {
    pub const CASCADE: [TieBreakRule; 4] = [
        TieBreakRule::PriorRoundPerformance,
        TieBreakRule::CumulativeSupport,
        TieBreakRule::FirstPreferences,
        TieBreakRule::CandidateOrderingIdentifier,
    ];

    pub fn number(&self) -> u32 {
        match self {
            TieBreakRule::PriorRoundPerformance => 1,
            TieBreakRule::CumulativeSupport => 2,
            TieBreakRule::FirstPreferences => 3,
            TieBreakRule::CandidateOrderingIdentifier => 4,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            TieBreakRule::PriorRoundPerformance => "prior round performance",
            TieBreakRule::CumulativeSupport => "cumulative support",
            TieBreakRule::FirstPreferences => "first-preference votes",
            TieBreakRule::CandidateOrderingIdentifier => "candidate ordering identifier",
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum RuleOutcome {
    /// More than one candidate survived this rule.
    Tied,
    /// Exactly one candidate survived this rule.
    Resolved,
}

/// One step of the tie-break cascade.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RuleStep {
    pub rule: TieBreakRule,
    /// The compared values, for every candidate of the initial tie, by candidate id.
    pub values: Vec<(CandidateId, String)>,
    /// The candidates still tied after this rule.
    pub remaining: Vec<CandidateId>,
    pub outcome: RuleOutcome,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum TieBreakKind {
    /// Candidates elected in the same iteration had to be put in order.
    ElectionOrder { ordered: Vec<CandidateId> },
    /// Candidates tied for the lowest total.
    Elimination { selected: CandidateId },
}

/// A resolved tie, with the full trace of the rules applied.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct TieBreak {
    pub kind: TieBreakKind,
    /// The tied candidates, sorted by id.
    pub candidate_ids: Vec<CandidateId>,
    pub rule_trace: Vec<RuleStep>,
}

impl TieBreak {
    /// The rule that settled the tie.
    pub fn resolving_step(&self) -> Option<&RuleStep> {
        self.rule_trace
            .iter()
            .find(|step| step.outcome == RuleOutcome::Resolved)
    }
}

/// A candidate removed because an exclusion group reached its maximum.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ForcedExclusion {
    pub candidate_id: CandidateId,
    pub group_public_id: String,
    pub group_name: String,
    pub triggered_by: CandidateId,
}

/// Statistics for one iteration of the count.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RoundRecord {
    pub iteration: u32,
    /// Candidates whose retained total reached the quota in this iteration.
    pub quota_reached: Vec<CandidateId>,
    /// All the candidates elected in this iteration, in election order.
    pub elected: Vec<CandidateId>,
    /// The subset of `elected` that reached the quota.
    pub elected_by_quota: Vec<CandidateId>,
    /// The subset of `elected` elected because they exactly filled the remaining seats.
    pub elected_to_fill_remaining_seats: Vec<CandidateId>,
    pub eliminated: Option<CandidateId>,
    pub forced_exclusions: Vec<ForcedExclusion>,
    pub tie_breaks: Vec<TieBreak>,
    /// Continuing, not yet elected candidates at the end of the iteration.
    pub eligible_candidates: Vec<CandidateId>,
    /// By candidate id, for every candidate of the election.
    pub retention_factors: Vec<(CandidateId, VoteValue)>,
    /// By candidate id, for every candidate of the election.
    pub retained_totals: Vec<(CandidateId, VoteValue)>,
    pub numerically_converged: bool,
    pub max_retention_delta: VoteValue,
    pub seats: u32,
    pub elected_total: u32,
    pub count_complete: bool,
    pub audit_text: String,
    pub summary_text: String,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct TallyResult {
    pub quota: VoteValue,
    pub elected: Vec<CandidateId>,
    pub eliminated: Vec<CandidateId>,
    pub forced_excluded: Vec<CandidateId>,
    pub rounds: Vec<RoundRecord>,
}

/// Errors that prevent the count from completing.
///
/// None of them leaves a partial result behind: the caller either gets a
/// complete `TallyResult` or one of these.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum TallyError {
    InvalidSeats,
    DuplicateCandidate(CandidateId),
    DuplicateTiebreakUuid(Uuid),
    UnknownGroupCandidate {
        group: String,
        candidate_id: CandidateId,
    },
    InvalidGroup(String),
    /// A ballot or a group given by name refers to a name nobody stands under.
    UnknownCandidateName(String),
    /// The iteration budget was exhausted. Never approximated.
    NoConvergence { iterations: u32 },
}

impl Error for TallyError {}

impl Display for TallyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TallyError::InvalidSeats => write!(f, "the number of seats must be positive"),
            TallyError::DuplicateCandidate(cid) => write!(f, "candidate {} is declared twice", cid),
            TallyError::DuplicateTiebreakUuid(u) => {
                write!(f, "tie-break identifier {} is shared by two candidates", u)
            }
            TallyError::UnknownGroupCandidate {
                group,
                candidate_id,
            } => write!(
                f,
                "exclusion group {:?} refers to unknown candidate {}",
                group, candidate_id
            ),
            TallyError::InvalidGroup(group) => {
                write!(f, "exclusion group {:?} must allow at least one winner", group)
            }
            TallyError::UnknownCandidateName(name) => {
                write!(f, "no candidate is named {:?}", name)
            }
            TallyError::NoConvergence { iterations } => write!(
                f,
                "Meek STV did not converge within {} iterations",
                iterations
            ),
        }
    }
}
