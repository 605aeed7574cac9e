use std::fs;

use log::debug;
use meek_stv::{Ballot, Candidate, ExclusionGroup, TallyRules, VoteValue};
use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;
use snafu::prelude::*;
use uuid::Uuid;

use crate::elections::credentials::InMemoryDirectory;
use crate::elections::*;

// ********* Settings ***********

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "minMembershipAgeDays", default = "default_min_membership_age_days")]
    pub min_membership_age_days: i64,
    #[serde(rename = "publicBaseUrl", default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(rename = "tallyEpsilon")]
    pub tally_epsilon: Option<String>,
    #[serde(rename = "tallyMaxIterations")]
    pub tally_max_iterations: Option<u32>,
}

fn default_min_membership_age_days() -> i64 {
    90
}

fn default_public_base_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            min_membership_age_days: default_min_membership_age_days(),
            public_base_url: default_public_base_url(),
            tally_epsilon: None,
            tally_max_iterations: None,
        }
    }
}

impl Settings {
    pub fn from_file(path: &str) -> ElectionResult<Settings> {
        let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
        serde_json::from_str(&contents).context(ParsingJsonSnafu {})
    }

    pub fn tally_rules(&self) -> ElectionResult<TallyRules> {
        read_rules(self.tally_epsilon.as_deref(), self.tally_max_iterations)
    }
}

fn read_rules(epsilon: Option<&str>, max_iterations: Option<u32>) -> ElectionResult<TallyRules> {
    let defaults = TallyRules::default();
    let epsilon = match epsilon {
        Some(s) => {
            let v: VoteValue = s.parse().map_err(|_| ElectionError::Validation {
                message: format!("tally epsilon {:?} is not a decimal number", s),
            })?;
            ensure!(
                v.is_positive(),
                ValidationSnafu {
                    message: format!("tally epsilon {:?} must be positive", s)
                }
            );
            v
        }
        None => defaults.epsilon,
    };
    let max_iterations = match max_iterations {
        Some(0) => {
            return ValidationSnafu {
                message: "tally max iterations must be positive",
            }
            .fail()
        }
        Some(n) => n,
        None => defaults.max_iterations,
    };
    Ok(TallyRules {
        epsilon,
        max_iterations,
    })
}

// ********* Tally input file ***********

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TallyFileCandidate {
    pub id: CandidateId,
    pub name: String,
    #[serde(rename = "tiebreakUuid")]
    pub tiebreak_uuid: Uuid,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TallyFileGroup {
    #[serde(rename = "publicId")]
    pub public_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "maxElected")]
    pub max_elected: u32,
    #[serde(rename = "candidateIds")]
    pub candidate_ids: Vec<CandidateId>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TallyFileBallot {
    pub ranking: Vec<CandidateId>,
    #[serde(default = "default_weight")]
    pub weight: u64,
}

fn default_weight() -> u64 {
    1
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TallyFileRules {
    pub epsilon: Option<String>,
    #[serde(rename = "maxIterations")]
    pub max_iterations: Option<u32>,
}

/// A self-contained description of a count.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TallyFile {
    pub name: Option<String>,
    pub seats: u32,
    pub candidates: Vec<TallyFileCandidate>,
    #[serde(rename = "exclusionGroups", default)]
    pub exclusion_groups: Vec<TallyFileGroup>,
    pub ballots: Vec<TallyFileBallot>,
    pub rules: Option<TallyFileRules>,
}

impl TallyFile {
    pub fn from_file(path: &str) -> ElectionResult<TallyFile> {
        let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
        debug!("TallyFile::from_file: read {} bytes from {:?}", contents.len(), path);
        serde_json::from_str(&contents).context(ParsingJsonSnafu {})
    }

    pub fn rules(&self) -> ElectionResult<TallyRules> {
        match &self.rules {
            Some(r) => read_rules(r.epsilon.as_deref(), r.max_iterations),
            None => Ok(TallyRules::default()),
        }
    }

    pub fn engine_candidates(&self) -> Vec<Candidate> {
        self.candidates
            .iter()
            .map(|c| Candidate {
                id: c.id,
                name: c.name.clone(),
                tiebreak_uuid: c.tiebreak_uuid,
            })
            .collect()
    }

    pub fn engine_groups(&self) -> Vec<ExclusionGroup> {
        self.exclusion_groups
            .iter()
            .map(|g| ExclusionGroup {
                public_id: g.public_id.clone(),
                name: g.name.clone(),
                max_elected: g.max_elected,
                candidate_ids: g.candidate_ids.clone(),
            })
            .collect()
    }

    pub fn engine_ballots(&self) -> Vec<Ballot> {
        self.ballots
            .iter()
            .map(|b| Ballot {
                ranking: b.ranking.clone(),
                weight: b.weight,
            })
            .collect()
    }
}

// ********* Scenario file ***********

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioCandidate {
    pub username: String,
    #[serde(rename = "nominatedBy", default)]
    pub nominated_by: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioGroup {
    pub name: String,
    #[serde(rename = "maxElected")]
    pub max_elected: u32,
    /// Usernames of the candidates.
    pub candidates: Vec<String>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioVote {
    pub username: String,
    /// Usernames of the candidates, most preferred first.
    pub ranking: Vec<String>,
}

/// An election replayed from draft to tally.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub election: ElectionDraft,
    pub candidates: Vec<ScenarioCandidate>,
    #[serde(rename = "exclusionGroups", default)]
    pub exclusion_groups: Vec<ScenarioGroup>,
    #[serde(default)]
    pub directory: InMemoryDirectory,
    /// In submission order. Later votes of the same voter supersede earlier ones.
    #[serde(default)]
    pub votes: Vec<ScenarioVote>,
}

impl ScenarioFile {
    pub fn from_file(path: &str) -> ElectionResult<ScenarioFile> {
        let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
        serde_json::from_str(&contents).context(ParsingJsonSnafu {})
    }
}

/// Reads a JSON document, used for reference results.
pub fn read_summary(path: &str) -> ElectionResult<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
    debug!("read_summary: {:?}", js);
    Ok(js)
}
