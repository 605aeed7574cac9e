//! Ballot submission, turnout and receipt lookup.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;

use crate::elections::config_reader::Settings;
use crate::elections::credentials::{eligible_voters, MembershipDirectory};
use crate::elections::ledger::{ballot_hash, chain_link, fresh_nonce, genesis_hash, is_sha256_hex};
use crate::elections::store::{ElectionRecord, ElectionStore};
use crate::elections::*;

fn validate_ranking(record: &ElectionRecord, ranking: &[CandidateId]) -> ElectionResult<()> {
    if ranking.is_empty() {
        return Err(ElectionError::InvalidRanking {
            message: "the ranking is empty".to_string(),
        });
    }
    let mut seen: HashSet<CandidateId> = HashSet::new();
    for cid in ranking.iter() {
        if !record.candidates.iter().any(|c| c.id == *cid) {
            return Err(ElectionError::InvalidRanking {
                message: format!("candidate {} does not stand in this election", cid),
            });
        }
        if !seen.insert(*cid) {
            return Err(ElectionError::InvalidRanking {
                message: format!("candidate {} is ranked more than once", cid),
            });
        }
    }
    Ok(())
}

fn check_chain_head(record: &ElectionRecord) -> ElectionResult<()> {
    let expected = match record.ballots.last() {
        Some(b) => b.chain_hash.clone(),
        None => genesis_hash(record.election.id),
    };
    if record.chain_head != expected {
        return Err(ElectionError::ChainIntegrity {
            election_id: record.election.id,
            position: record.ballots.len(),
            detail: format!(
                "stored chain head {} does not match the last ballot {}",
                record.chain_head, expected
            ),
        });
    }
    Ok(())
}

/// Records a ballot and appends it to the chain of the election.
///
/// The weight comes from the credential. A previous counted ballot of the same
/// credential is superseded, but stays in the chain.
pub fn submit_ballot(
    store: &ElectionStore,
    election_id: ElectionId,
    credential_public_id: &str,
    voter_username: &str,
    ranking: &[CandidateId],
    now: DateTime<Utc>,
) -> ElectionResult<BallotReceipt> {
    store.with_election(election_id, |record| {
        if record.election.status != ElectionStatus::Open || now >= record.election.end_datetime {
            return Err(ElectionError::ElectionNotOpen { election_id });
        }

        let credential = record
            .credentials
            .iter()
            .find(|c| c.public_id == credential_public_id)
            .ok_or(ElectionError::InvalidCredential {
                reason: CredentialProblem::NotFound,
            })?;
        if credential.freeipa_username.as_deref() != Some(voter_username.trim()) {
            return Err(ElectionError::InvalidCredential {
                reason: CredentialProblem::OwnedByAnotherVoter,
            });
        }
        let weight = credential.weight;

        validate_ranking(record, ranking)?;
        if let Err(e) = check_chain_head(record) {
            error!("submit_ballot: election {}: {}", election_id, e);
            return Err(e);
        }

        // Nothing below can fail.
        let nonce = fresh_nonce();
        let bh = ballot_hash(election_id, credential_public_id, ranking, weight, &nonce);
        let previous_chain_hash = record.chain_head.clone();
        let chain_hash = chain_link(&previous_chain_hash, &bh);
        let ballot_id = record.next_row_id();

        let mut superseded_hash: Option<String> = None;
        if let Some(current) = record
            .ballots
            .iter_mut()
            .find(|b| b.credential_public_id == credential_public_id && b.is_counted())
        {
            current.superseded_by = Some(ballot_id);
            superseded_hash = Some(current.ballot_hash.clone());
        }

        record.ballots.push(BallotRecord {
            id: ballot_id,
            election_id,
            credential_public_id: credential_public_id.to_string(),
            ranking: ranking.to_vec(),
            weight,
            nonce: nonce.clone(),
            ballot_hash: bh.clone(),
            previous_chain_hash: previous_chain_hash.clone(),
            chain_hash: chain_hash.clone(),
            superseded_by: None,
            created_at: now,
        });
        record.chain_head = chain_hash.clone();

        let mut payload = json!({ "ballot_hash": bh });
        if let Some(h) = &superseded_hash {
            payload["supersedes_ballot_hash"] = json!(h);
        }
        record.append_audit(EVENT_BALLOT_SUBMITTED, payload, true, now);
        info!(
            "submit_ballot: election {}: ballot {} chained as {}",
            election_id, bh, chain_hash
        );
        if let Some(h) = &superseded_hash {
            debug!("submit_ballot: election {}: supersedes {}", election_id, h);
        }

        let status = quorum_status_of(record);
        if status.required_participating_voter_count > 0
            && status.quorum_met
            && record.audit_events(EVENT_QUORUM_REACHED).is_empty()
        {
            info!("submit_ballot: election {}: quorum reached", election_id);
            record.append_audit(EVENT_QUORUM_REACHED, status.to_json(), true, now);
        }

        Ok(BallotReceipt {
            ballot_id,
            ballot_hash: bh,
            nonce,
            previous_chain_hash,
            chain_hash,
        })
    })
}

// ********* Quorum ***********

#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub struct QuorumStatus {
    pub quorum_percent: u32,
    pub quorum_met: bool,
    pub required_participating_voter_count: u64,
    pub eligible_voter_count: u64,
    pub eligible_vote_weight_total: u64,
    pub participating_voter_count: u64,
    pub participating_vote_weight_total: u64,
}

impl QuorumStatus {
    fn compute(quorum_percent: u32, eligible: (u64, u64), participating: (u64, u64)) -> QuorumStatus {
        let (eligible_voter_count, eligible_vote_weight_total) = eligible;
        let (participating_voter_count, participating_vote_weight_total) = participating;
        let required = if quorum_percent > 0 && eligible_voter_count > 0 {
            (eligible_voter_count * quorum_percent as u64 + 99) / 100
        } else {
            0
        };
        QuorumStatus {
            quorum_percent,
            quorum_met: required > 0 && participating_voter_count >= required,
            required_participating_voter_count: required,
            eligible_voter_count,
            eligible_vote_weight_total,
            participating_voter_count,
            participating_vote_weight_total,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "quorum_percent": self.quorum_percent,
            "quorum_met": self.quorum_met,
            "required_participating_voter_count": self.required_participating_voter_count,
            "eligible_voter_count": self.eligible_voter_count,
            "eligible_vote_weight_total": self.eligible_vote_weight_total,
            "participating_voter_count": self.participating_voter_count,
            "participating_vote_weight_total": self.participating_vote_weight_total,
        })
    }
}

fn participation(record: &ElectionRecord) -> (u64, u64) {
    record
        .counted_ballots()
        .fold((0, 0), |(n, w), b| (n + 1, w + b.weight))
}

/// Turnout against the issued credentials.
pub fn quorum_status_of(record: &ElectionRecord) -> QuorumStatus {
    let eligible = record
        .credentials
        .iter()
        .filter(|c| c.weight > 0)
        .fold((0, 0), |(n, w), c| (n + 1, w + c.weight));
    QuorumStatus::compute(record.election.quorum, eligible, participation(record))
}

/// Turnout of an election. Drafts have no credentials yet, their voters come
/// from the directory.
pub fn election_quorum_status(
    store: &ElectionStore,
    election_id: ElectionId,
    directory: &dyn MembershipDirectory,
    settings: &Settings,
) -> ElectionResult<QuorumStatus> {
    store.with_election(election_id, |record| {
        if record.election.status != ElectionStatus::Draft {
            return Ok(quorum_status_of(record));
        }
        let voters = eligible_voters(&record.election, directory, settings);
        let eligible = (
            voters.len() as u64,
            voters.iter().map(|v| v.weight).sum::<u64>(),
        );
        Ok(QuorumStatus::compute(
            record.election.quorum,
            eligible,
            participation(record),
        ))
    })
}

// ********* Receipts ***********

/// What anyone holding a ballot hash may learn. Never the ranking.
#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub struct ReceiptLookup {
    pub found: bool,
    pub is_counted: bool,
    pub is_superseded: bool,
    pub superseded_by: Option<String>,
    pub election_id: Option<ElectionId>,
    pub election_name: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ReceiptLookup {
    fn not_found() -> ReceiptLookup {
        ReceiptLookup {
            found: false,
            is_counted: false,
            is_superseded: false,
            superseded_by: None,
            election_id: None,
            election_name: None,
            submitted_at: None,
        }
    }
}

pub fn verify_receipt(store: &ElectionStore, receipt: &str) -> ElectionResult<ReceiptLookup> {
    let receipt = receipt.trim();
    if !is_sha256_hex(receipt) {
        return Err(ElectionError::Validation {
            message: "a receipt is a 64 character hex string".to_string(),
        });
    }
    let (election, ballot) = match store.find_ballot_by_hash(receipt) {
        Some(found) => found,
        None => return Ok(ReceiptLookup::not_found()),
    };
    let superseded_by = match ballot.superseded_by {
        Some(id) => store.with_election(election.id, |record| {
            Ok(record.ballot(id).map(|b| b.ballot_hash.clone()))
        })?,
        None => None,
    };
    Ok(ReceiptLookup {
        found: true,
        is_counted: ballot.is_counted(),
        is_superseded: !ballot.is_counted(),
        superseded_by,
        election_id: Some(election.id),
        election_name: Some(election.name),
        submitted_at: Some(ballot.created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elections::credentials::issue_voting_credential;
    use crate::elections::ledger::verify_ballot_records;
    use crate::elections::lifecycle::{add_candidate, create_election};
    use chrono::Duration;

    struct Fixture {
        store: ElectionStore,
        id: ElectionId,
        now: DateTime<Utc>,
        candidates: Vec<CandidateId>,
    }

    // An open election with 3 candidates and 4 credentials (alice has weight 2).
    fn open_election(quorum: u32) -> Fixture {
        let store = ElectionStore::new();
        let now = Utc::now();
        let draft = ElectionDraft {
            name: "Board".to_string(),
            description: String::new(),
            start_datetime: now,
            end_datetime: now + Duration::days(7),
            number_of_seats: 1,
            quorum,
            eligible_group_cn: None,
        };
        let id = create_election(&store, &draft).unwrap();
        let candidates: Vec<CandidateId> = ["ann", "ben", "cyd"]
            .iter()
            .map(|u| add_candidate(&store, id, u, "nominator", "").unwrap().id)
            .collect();
        for (u, w) in [("alice", 2), ("bob", 1), ("carol", 1), ("dave", 1)] {
            issue_voting_credential(&store, id, u, w, now).unwrap();
        }
        store
            .with_election(id, |r| {
                r.election.status = ElectionStatus::Open;
                Ok(())
            })
            .unwrap();
        Fixture {
            store,
            id,
            now,
            candidates,
        }
    }

    fn credential_of(f: &Fixture, username: &str) -> String {
        f.store
            .snapshot(f.id)
            .unwrap()
            .credentials
            .iter()
            .find(|c| c.freeipa_username.as_deref() == Some(username))
            .unwrap()
            .public_id
            .clone()
    }

    #[test]
    fn submission_extends_the_chain() {
        let f = open_election(0);
        let cred = credential_of(&f, "alice");
        let r1 = submit_ballot(&f.store, f.id, &cred, "alice", &f.candidates[..2], f.now).unwrap();
        assert_eq!(r1.previous_chain_hash, genesis_hash(f.id));
        let r2 = submit_ballot(&f.store, f.id, &credential_of(&f, "bob"), "bob", &[f.candidates[2]], f.now).unwrap();
        assert_eq!(r2.previous_chain_hash, r1.chain_hash);

        let snap = f.store.snapshot(f.id).unwrap();
        assert_eq!(snap.chain_head, r2.chain_hash);
        assert_eq!(snap.ballots[0].weight, 2);
        assert_eq!(verify_ballot_records(f.id, &snap.ballots).unwrap(), snap.chain_head);

        let audit = snap.audit_events(EVENT_BALLOT_SUBMITTED);
        assert_eq!(audit.len(), 2);
        assert!(audit[0].is_public);
        assert_eq!(audit[0].payload, json!({ "ballot_hash": r1.ballot_hash }));
    }

    #[test]
    fn resubmission_supersedes() {
        let f = open_election(0);
        let cred = credential_of(&f, "bob");
        let r1 = submit_ballot(&f.store, f.id, &cred, "bob", &[f.candidates[0]], f.now).unwrap();
        let r2 = submit_ballot(&f.store, f.id, &cred, "bob", &[f.candidates[0]], f.now).unwrap();
        assert_ne!(r1.ballot_hash, r2.ballot_hash);

        let snap = f.store.snapshot(f.id).unwrap();
        assert_eq!(snap.ballots.len(), 2);
        assert!(!snap.ballots[0].is_counted());
        assert_eq!(snap.ballots[0].superseded_by, Some(r2.ballot_id));
        assert!(snap.ballots[1].is_counted());
        assert_eq!(snap.counted_ballots().count(), 1);
        assert_eq!(snap.chain_head, r2.chain_hash);
        let last = snap.audit_events(EVENT_BALLOT_SUBMITTED)[1].payload.clone();
        assert_eq!(last["supersedes_ballot_hash"], json!(r1.ballot_hash));

        let lookup = verify_receipt(&f.store, &r1.ballot_hash).unwrap();
        assert!(lookup.found);
        assert!(lookup.is_superseded);
        assert_eq!(lookup.superseded_by, Some(r2.ballot_hash.clone()));
        assert_eq!(lookup.election_id, Some(f.id));
        let lookup = verify_receipt(&f.store, &r2.ballot_hash.to_uppercase()).unwrap();
        assert!(lookup.is_counted);
    }

    #[test]
    fn rejections_in_order() {
        let f = open_election(0);
        let cred = credential_of(&f, "alice");
        let ok = &f.candidates[..1];

        let err = submit_ballot(&f.store, f.id, "nope", "alice", ok, f.now).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.code(), "invalid_credential");
        let err = submit_ballot(&f.store, f.id, &cred, "bob", ok, f.now).unwrap_err();
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.to_string(), "Invalid credential");

        let err = submit_ballot(&f.store, f.id, &cred, "alice", &[], f.now).unwrap_err();
        assert_eq!(err.code(), "invalid_ranking");
        let dup = [f.candidates[0], f.candidates[0]];
        assert!(submit_ballot(&f.store, f.id, &cred, "alice", &dup, f.now).is_err());
        assert!(submit_ballot(&f.store, f.id, &cred, "alice", &[999], f.now).is_err());

        let late = f.now + Duration::days(8);
        let err = submit_ballot(&f.store, f.id, &cred, "alice", ok, late).unwrap_err();
        assert_eq!(err.code(), "election_not_open");

        // Nothing was written by the failures.
        let snap = f.store.snapshot(f.id).unwrap();
        assert!(snap.ballots.is_empty());
        assert_eq!(snap.chain_head, genesis_hash(f.id));
        assert!(snap.audit_log.is_empty());
    }

    #[test]
    fn tampered_head_blocks_submission() {
        let f = open_election(0);
        let cred = credential_of(&f, "alice");
        submit_ballot(&f.store, f.id, &cred, "alice", &f.candidates[..1], f.now).unwrap();
        f.store
            .with_election(f.id, |r| {
                r.chain_head = genesis_hash(f.id);
                Ok(())
            })
            .unwrap();
        let err = submit_ballot(&f.store, f.id, &cred, "alice", &f.candidates[..1], f.now).unwrap_err();
        assert_eq!(err.code(), "chain_integrity_failure");
        assert_eq!(f.store.snapshot(f.id).unwrap().ballots.len(), 1);
    }

    #[test]
    fn quorum_is_logged_once() {
        let f = open_election(50);
        let status = quorum_status_of(&f.store.snapshot(f.id).unwrap());
        assert_eq!(status.required_participating_voter_count, 2);
        assert_eq!(status.eligible_vote_weight_total, 5);
        assert!(!status.quorum_met);

        for u in ["alice", "bob", "carol"] {
            submit_ballot(&f.store, f.id, &credential_of(&f, u), u, &f.candidates[..1], f.now).unwrap();
        }
        let snap = f.store.snapshot(f.id).unwrap();
        let reached = snap.audit_events(EVENT_QUORUM_REACHED);
        assert_eq!(reached.len(), 1);
        assert_eq!(reached[0].payload["participating_voter_count"], json!(2));
        assert_eq!(reached[0].payload["participating_vote_weight_total"], json!(3));
        assert!(quorum_status_of(&snap).quorum_met);
    }

    #[test]
    fn no_quorum_requirement_never_logs() {
        let f = open_election(0);
        submit_ballot(&f.store, f.id, &credential_of(&f, "bob"), "bob", &f.candidates[..1], f.now).unwrap();
        let snap = f.store.snapshot(f.id).unwrap();
        assert!(snap.audit_events(EVENT_QUORUM_REACHED).is_empty());
        assert!(!quorum_status_of(&snap).quorum_met);
    }

    #[test]
    fn unknown_receipts() {
        let f = open_election(0);
        assert!(!verify_receipt(&f.store, &"ab".repeat(32)).unwrap().found);
        assert_eq!(verify_receipt(&f.store, "xyz").unwrap_err().code(), "validation");
    }

    #[test]
    fn concurrent_submissions_do_not_fork() {
        let f = open_election(0);
        let voters = ["alice", "bob", "carol", "dave"];
        let creds: Vec<String> = voters.iter().map(|u| credential_of(&f, u)).collect();
        std::thread::scope(|s| {
            for (u, cred) in voters.iter().zip(creds.iter()) {
                let f = &f;
                s.spawn(move || {
                    for _ in 0..5 {
                        submit_ballot(&f.store, f.id, cred, u, &f.candidates, f.now).unwrap();
                    }
                });
            }
        });
        let snap = f.store.snapshot(f.id).unwrap();
        assert_eq!(snap.ballots.len(), 20);
        assert_eq!(snap.counted_ballots().count(), 4);
        assert_eq!(verify_ballot_records(f.id, &snap.ballots).unwrap(), snap.chain_head);
        let previous: HashSet<&str> = snap.ballots.iter().map(|b| b.previous_chain_hash.as_str()).collect();
        assert_eq!(previous.len(), 20);
    }
}
