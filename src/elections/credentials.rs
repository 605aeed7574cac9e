use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::elections::config_reader::Settings;
use crate::elections::store::{ElectionRecord, ElectionStore};
use crate::elections::*;

// ********* Membership directory ***********

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct MembershipType {
    pub code: String,
    pub votes: u64,
    #[serde(rename = "isIndividual")]
    pub is_individual: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub username: String,
    #[serde(rename = "membershipType")]
    pub membership_type: MembershipType,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryGroup {
    pub cn: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(rename = "memberGroups", default)]
    pub member_groups: Vec<String>,
}

/// The identity service that knows the memberships and the groups.
pub trait MembershipDirectory {
    fn memberships(&self) -> Vec<MembershipRecord>;

    /// Looks up a group by name, case-insensitively.
    fn group(&self, cn: &str) -> Option<DirectoryGroup>;
}

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryDirectory {
    #[serde(default)]
    pub memberships: Vec<MembershipRecord>,
    #[serde(default)]
    pub groups: Vec<DirectoryGroup>,
}

impl MembershipDirectory for InMemoryDirectory {
    fn memberships(&self) -> Vec<MembershipRecord> {
        self.memberships.clone()
    }

    fn group(&self, cn: &str) -> Option<DirectoryGroup> {
        let key = cn.trim().to_lowercase();
        self.groups
            .iter()
            .find(|g| g.cn.trim().to_lowercase() == key)
            .cloned()
    }
}

// ********* Eligibility ***********

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct EligibleVoter {
    pub username: String,
    pub weight: u64,
}

// A membership grants votes if it is an enabled individual membership, old
// enough at the start of the election and not expired by then.
fn grants_votes(m: &MembershipRecord, start: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    let t = &m.membership_type;
    t.is_individual
        && t.enabled
        && t.votes > 0
        && m.created_at <= cutoff
        && m.expires_at.map(|e| e >= start).unwrap_or(true)
}

fn membership_cutoff(election: &Election, settings: &Settings) -> DateTime<Utc> {
    election.start_datetime - Duration::days(settings.min_membership_age_days)
}

/// Lowercased usernames of the members of a group, nested groups included.
pub fn group_member_usernames(directory: &dyn MembershipDirectory, group_cn: &str) -> BTreeSet<String> {
    let mut members: BTreeSet<String> = BTreeSet::new();
    let mut seen_groups: HashSet<String> = HashSet::new();
    let mut pending: Vec<String> = vec![group_cn.trim().to_string()];

    while let Some(cn) = pending.pop() {
        let cn = cn.trim().to_string();
        if cn.is_empty() || !seen_groups.insert(cn.to_lowercase()) {
            continue;
        }
        let group = match directory.group(&cn) {
            Some(g) => g,
            None => continue,
        };
        for username in group.members.iter() {
            let username = username.trim();
            if !username.is_empty() {
                members.insert(username.to_lowercase());
            }
        }
        pending.extend(group.member_groups.iter().cloned());
    }
    members
}

fn restricted_group(election: &Election) -> Option<&str> {
    election
        .eligible_group_cn
        .as_deref()
        .map(|cn| cn.trim())
        .filter(|cn| !cn.is_empty())
}

/// The voters of an election and their weights, sorted by lowercased username.
pub fn eligible_voters(
    election: &Election,
    directory: &dyn MembershipDirectory,
    settings: &Settings,
) -> Vec<EligibleVoter> {
    let cutoff = membership_cutoff(election, settings);
    let mut weights: BTreeMap<String, u64> = BTreeMap::new();
    for m in directory.memberships().iter() {
        let username = m.username.trim();
        if username.is_empty() || !grants_votes(m, election.start_datetime, cutoff) {
            continue;
        }
        *weights.entry(username.to_string()).or_insert(0) += m.membership_type.votes;
    }

    if let Some(cn) = restricted_group(election) {
        let allowed = group_member_usernames(directory, cn);
        weights.retain(|username, _| allowed.contains(&username.to_lowercase()));
    }

    let mut res: Vec<EligibleVoter> = weights
        .into_iter()
        .filter(|(_, weight)| *weight > 0)
        .map(|(username, weight)| EligibleVoter { username, weight })
        .collect();
    res.sort_by_key(|v| (v.username.to_lowercase(), v.username.clone()));
    debug!(
        "eligible_voters: election {}: {} eligible voters",
        election.id,
        res.len()
    );
    res
}

/// The weight of a single voter, 0 if ineligible.
pub fn eligible_vote_weight_for_username(
    election: &Election,
    directory: &dyn MembershipDirectory,
    settings: &Settings,
    username: &str,
) -> u64 {
    let username = username.trim();
    if username.is_empty() {
        return 0;
    }
    if let Some(cn) = restricted_group(election) {
        if !group_member_usernames(directory, cn).contains(&username.to_lowercase()) {
            return 0;
        }
    }
    let cutoff = membership_cutoff(election, settings);
    directory
        .memberships()
        .iter()
        .filter(|m| m.username.trim() == username && grants_votes(m, election.start_datetime, cutoff))
        .map(|m| m.membership_type.votes)
        .sum()
}

// ********* Issuance ***********

fn new_credential_public_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Creates the credential of a voter, or updates its weight. The public id of
/// an existing credential never changes.
pub(crate) fn upsert_credential(
    record: &mut ElectionRecord,
    username: &str,
    weight: u64,
    now: DateTime<Utc>,
) -> ElectionResult<VotingCredential> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ElectionError::Validation {
            message: "a username is required".to_string(),
        });
    }
    if weight == 0 {
        return Err(ElectionError::Validation {
            message: "the weight of a credential must be positive".to_string(),
        });
    }
    record.require_status(
        "issue credentials",
        &[ElectionStatus::Draft, ElectionStatus::Open],
    )?;

    if let Some(existing) = record
        .credentials
        .iter_mut()
        .find(|c| c.freeipa_username.as_deref() == Some(username))
    {
        existing.weight = weight;
        return Ok(existing.clone());
    }

    let mut public_id = new_credential_public_id();
    while record.credentials.iter().any(|c| c.public_id == public_id) {
        public_id = new_credential_public_id();
    }
    let credential = VotingCredential {
        id: record.next_row_id(),
        election_id: record.election.id,
        public_id,
        freeipa_username: Some(username.to_string()),
        weight,
        created_at: now,
    };
    record.credentials.push(credential.clone());
    Ok(credential)
}

/// Issues (or re-issues) one credential with an explicit weight.
pub fn issue_voting_credential(
    store: &ElectionStore,
    election_id: ElectionId,
    username: &str,
    weight: u64,
    now: DateTime<Utc>,
) -> ElectionResult<VotingCredential> {
    store.with_election(election_id, |record| {
        upsert_credential(record, username, weight, now)
    })
}

/// Issues the credential of one voter, with the weight granted by their memberships.
pub fn issue_voting_credential_for_user(
    store: &ElectionStore,
    election_id: ElectionId,
    directory: &dyn MembershipDirectory,
    settings: &Settings,
    username: &str,
    now: DateTime<Utc>,
) -> ElectionResult<VotingCredential> {
    store.with_election(election_id, |record| {
        let weight = eligible_vote_weight_for_username(&record.election, directory, settings, username);
        if weight == 0 {
            return Err(ElectionError::VoterIneligible { election_id });
        }
        upsert_credential(record, username, weight, now)
    })
}

pub(crate) fn issue_from_memberships_locked(
    record: &mut ElectionRecord,
    directory: &dyn MembershipDirectory,
    settings: &Settings,
    now: DateTime<Utc>,
) -> ElectionResult<Vec<VotingCredential>> {
    record.require_status(
        "issue credentials",
        &[ElectionStatus::Draft, ElectionStatus::Open],
    )?;
    let voters = eligible_voters(&record.election, directory, settings);
    let mut issued: Vec<VotingCredential> = Vec::new();
    for voter in voters.iter() {
        issued.push(upsert_credential(record, &voter.username, voter.weight, now)?);
    }
    info!(
        "issue_credentials_from_memberships: election {}: {} credentials",
        record.election.id,
        issued.len()
    );
    Ok(issued)
}

/// Issues the credentials of every eligible voter. Returns the affected credentials.
pub fn issue_credentials_from_memberships(
    store: &ElectionStore,
    election_id: ElectionId,
    directory: &dyn MembershipDirectory,
    settings: &Settings,
    now: DateTime<Utc>,
) -> ElectionResult<Vec<VotingCredential>> {
    store.with_election(election_id, |record| {
        issue_from_memberships_locked(record, directory, settings, now)
    })
}
