//! The JSON documents published for an election.

use std::collections::{BTreeMap, HashMap};
use std::fs;

use log::{debug, info};
use meek_stv::{RoundRecord, RuleOutcome, TallyResult, TieBreak, TieBreakKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JSMap, Value as JSValue};
use snafu::prelude::*;

use crate::elections::ledger::{genesis_hash, is_sha256_hex, verify_chain, ChainLink};
use crate::elections::store::ElectionStore;
use crate::elections::*;

// ********* Tally results ***********

fn tie_break_to_json(tb: &TieBreak) -> JSValue {
    let steps: Vec<JSValue> = tb
        .rule_trace
        .iter()
        .map(|step| {
            let mut values: JSMap<String, JSValue> = JSMap::new();
            for (cid, v) in step.values.iter() {
                values.insert(cid.to_string(), json!(v));
            }
            let outcome = match step.outcome {
                RuleOutcome::Tied => "tied",
                RuleOutcome::Resolved => "resolved",
            };
            json!({
                "rule": step.rule.number(),
                "title": step.rule.title(),
                "values": values,
                "remaining": step.remaining,
                "outcome": outcome,
            })
        })
        .collect();
    let mut js = json!({
        "candidate_ids": tb.candidate_ids,
        "rule_trace": steps,
    });
    match &tb.kind {
        TieBreakKind::ElectionOrder { ordered } => {
            js["kind"] = json!("election_order");
            js["ordered"] = json!(ordered);
        }
        TieBreakKind::Elimination { selected } => {
            js["kind"] = json!("elimination");
            js["selected"] = json!(selected);
        }
    }
    js
}

fn round_to_json(round: &RoundRecord) -> JSValue {
    let mut retention: JSMap<String, JSValue> = JSMap::new();
    for (cid, v) in round.retention_factors.iter() {
        retention.insert(cid.to_string(), json!(v.to_string()));
    }
    let mut retained: JSMap<String, JSValue> = JSMap::new();
    for (cid, v) in round.retained_totals.iter() {
        retained.insert(cid.to_string(), json!(v.to_string()));
    }
    let forced: Vec<JSValue> = round
        .forced_exclusions
        .iter()
        .map(|f| {
            json!({
                "candidate_id": f.candidate_id,
                "group_public_id": f.group_public_id,
                "group_name": f.group_name,
                "triggered_by": f.triggered_by,
            })
        })
        .collect();
    json!({
        "iteration": round.iteration,
        "quota_reached": round.quota_reached,
        "elected": round.elected,
        "elected_by_quota": round.elected_by_quota,
        "elected_to_fill_remaining_seats": round.elected_to_fill_remaining_seats,
        "eliminated": round.eliminated,
        "forced_exclusions": forced,
        "tie_breaks": round.tie_breaks.iter().map(tie_break_to_json).collect::<Vec<JSValue>>(),
        "eligible_candidates": round.eligible_candidates,
        "retention_factors": retention,
        "retained_totals": retained,
        "numerically_converged": round.numerically_converged,
        "max_retention_delta": round.max_retention_delta.to_string(),
        "seats": round.seats,
        "elected_total": round.elected_total,
        "count_complete": round.count_complete,
        "audit_text": round.audit_text,
        "summary_text": round.summary_text,
    })
}

/// The stored form of a tally. Vote values are exact decimal strings.
pub fn tally_result_to_json(result: &TallyResult) -> JSValue {
    json!({
        "quota": result.quota.to_string(),
        "elected": result.elected,
        "eliminated": result.eliminated,
        "forced_excluded": result.forced_excluded,
        "rounds": result.rounds.iter().map(round_to_json).collect::<Vec<JSValue>>(),
    })
}

// ********* Public ballots ***********

/// One ballot as published. The credential is left out.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PublicBallotRow {
    pub ranking: Vec<CandidateId>,
    pub weight: u64,
    pub ballot_hash: String,
    pub is_counted: bool,
    pub chain_hash: String,
    pub previous_chain_hash: String,
    /// Hash of the ballot that replaced this one.
    pub superseded_by: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PublicBallotsExport {
    pub election_id: ElectionId,
    pub genesis_hash: String,
    pub chain_head: String,
    /// Every submission, in chain order.
    pub ballots: Vec<PublicBallotRow>,
}

impl PublicBallotsExport {
    pub fn from_file(path: &str) -> ElectionResult<PublicBallotsExport> {
        let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
        serde_json::from_str(&contents).context(ParsingJsonSnafu {})
    }
}

pub fn public_ballots_export(store: &ElectionStore, election_id: ElectionId) -> ElectionResult<PublicBallotsExport> {
    store.with_election(election_id, |record| {
        record.require_status(
            "export ballots",
            &[ElectionStatus::Closed, ElectionStatus::Tallied],
        )?;
        let hashes: HashMap<BallotId, &str> = record
            .ballots
            .iter()
            .map(|b| (b.id, b.ballot_hash.as_str()))
            .collect();
        let ballots: Vec<PublicBallotRow> = record
            .ballots
            .iter()
            .map(|b| PublicBallotRow {
                ranking: b.ranking.clone(),
                weight: b.weight,
                ballot_hash: b.ballot_hash.clone(),
                is_counted: b.is_counted(),
                chain_hash: b.chain_hash.clone(),
                previous_chain_hash: b.previous_chain_hash.clone(),
                superseded_by: b
                    .superseded_by
                    .and_then(|id| hashes.get(&id))
                    .map(|h| h.to_string()),
            })
            .collect();
        debug!(
            "public_ballots_export: election {}: {} ballots",
            election_id,
            ballots.len()
        );
        Ok(PublicBallotsExport {
            election_id,
            genesis_hash: genesis_hash(election_id),
            chain_head: record.chain_head.clone(),
            ballots,
        })
    })
}

/// Checks a published ballot list on its own: genesis, links, head, and
/// the superseding pointers. Returns the head.
pub fn verify_ballots_export(export: &PublicBallotsExport) -> ElectionResult<String> {
    let election_id = export.election_id;
    let chain_error = |position: usize, detail: String| ElectionError::ChainIntegrity {
        election_id,
        position,
        detail,
    };
    if export.genesis_hash != genesis_hash(election_id) {
        return Err(chain_error(
            0,
            format!("genesis hash {} is not the genesis of this election", export.genesis_hash),
        ));
    }
    let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
    for (position, b) in export.ballots.iter().enumerate() {
        if !is_sha256_hex(&b.ballot_hash) {
            return Err(chain_error(position, format!("{:?} is not a ballot hash", b.ballot_hash)));
        }
        positions.insert(b.ballot_hash.as_str(), position);
    }
    for (position, b) in export.ballots.iter().enumerate() {
        if b.is_counted != b.superseded_by.is_none() {
            return Err(chain_error(
                position,
                "is_counted disagrees with superseded_by".to_string(),
            ));
        }
        if let Some(h) = &b.superseded_by {
            match positions.get(h.as_str()) {
                Some(p) if *p > position => {}
                _ => {
                    return Err(chain_error(
                        position,
                        format!("superseded by {}, which does not follow it", h),
                    ))
                }
            }
        }
    }

    let head = verify_chain(
        election_id,
        export.ballots.iter().map(|b| ChainLink {
            ballot_hash: &b.ballot_hash,
            previous_chain_hash: &b.previous_chain_hash,
            chain_hash: &b.chain_hash,
        }),
    )?;
    if head != export.chain_head {
        return Err(chain_error(
            export.ballots.len(),
            format!("published head {} should be {}", export.chain_head, head),
        ));
    }
    info!(
        "verify_ballots_export: election {}: {} ballots, head {}",
        election_id,
        export.ballots.len(),
        head
    );
    Ok(head)
}

// ********* Public audit log ***********

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PublicAuditRow {
    pub event_type: String,
    pub payload: JSValue,
    pub timestamp: String,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PublicAuditExport {
    pub election_id: ElectionId,
    pub entries: Vec<PublicAuditRow>,
}

pub fn public_audit_export(store: &ElectionStore, election_id: ElectionId) -> ElectionResult<PublicAuditExport> {
    store.with_election(election_id, |record| {
        let entries = record
            .audit_log
            .iter()
            .filter(|e| e.is_public)
            .map(|e| PublicAuditRow {
                event_type: e.event_type.clone(),
                payload: e.payload.clone(),
                timestamp: e.timestamp.to_rfc3339(),
            })
            .collect();
        Ok(PublicAuditExport {
            election_id,
            entries,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elections::ballots::submit_ballot;
    use crate::elections::credentials::issue_voting_credential;
    use crate::elections::lifecycle::{add_candidate, close_election, create_election};
    use chrono::{Duration, Utc};
    use meek_stv::builder::Builder;
    use meek_stv::TallyRules;

    fn closed_election() -> (ElectionStore, ElectionId) {
        let store = ElectionStore::new();
        let now = Utc::now();
        let draft = ElectionDraft {
            name: "Board".to_string(),
            description: String::new(),
            start_datetime: now,
            end_datetime: now + Duration::days(1),
            number_of_seats: 1,
            quorum: 0,
            eligible_group_cn: None,
        };
        let id = create_election(&store, &draft).unwrap();
        let a = add_candidate(&store, id, "ann", "x", "").unwrap().id;
        let b = add_candidate(&store, id, "ben", "x", "").unwrap().id;
        let alice = issue_voting_credential(&store, id, "alice", 2, now).unwrap().public_id;
        let bob = issue_voting_credential(&store, id, "bob", 1, now).unwrap().public_id;
        store
            .with_election(id, |r| {
                r.election.status = ElectionStatus::Open;
                Ok(())
            })
            .unwrap();
        submit_ballot(&store, id, &alice, "alice", &[a], now).unwrap();
        submit_ballot(&store, id, &bob, "bob", &[b, a], now).unwrap();
        submit_ballot(&store, id, &alice, "alice", &[b], now).unwrap();
        close_election(&store, id, now).unwrap();
        (store, id)
    }

    #[test]
    fn ballots_export_is_verifiable() {
        let (store, id) = closed_election();
        let export = public_ballots_export(&store, id).unwrap();
        assert_eq!(export.ballots.len(), 3);
        assert!(!export.ballots[0].is_counted);
        assert_eq!(export.ballots[0].superseded_by, Some(export.ballots[2].ballot_hash.clone()));
        assert_eq!(verify_ballots_export(&export).unwrap(), export.chain_head);

        let js = serde_json::to_value(&export).unwrap();
        assert!(js["ballots"][0].get("credential_public_id").is_none());
        assert!(js["ballots"][0].get("nonce").is_none());
        let back: PublicBallotsExport = serde_json::from_value(js).unwrap();
        assert_eq!(back, export);
    }

    #[test]
    fn tampered_exports_fail() {
        let (store, id) = closed_election();
        let export = public_ballots_export(&store, id).unwrap();

        let mut dropped = export.clone();
        dropped.ballots.remove(1);
        assert!(verify_ballots_export(&dropped).is_err());

        let mut wrong_head = export.clone();
        wrong_head.chain_head = genesis_hash(id);
        assert!(verify_ballots_export(&wrong_head).is_err());

        let mut moved = export.clone();
        moved.election_id = id + 1;
        assert!(verify_ballots_export(&moved).is_err());

        let mut recounted = export;
        recounted.ballots[0].is_counted = true;
        assert_eq!(
            verify_ballots_export(&recounted).unwrap_err().code(),
            "chain_integrity_failure"
        );
    }

    #[test]
    fn only_closed_elections_export_ballots() {
        let store = ElectionStore::new();
        let now = Utc::now();
        let draft = ElectionDraft {
            name: "Board".to_string(),
            description: String::new(),
            start_datetime: now,
            end_datetime: now + Duration::days(1),
            number_of_seats: 1,
            quorum: 0,
            eligible_group_cn: None,
        };
        let id = create_election(&store, &draft).unwrap();
        assert_eq!(public_ballots_export(&store, id).unwrap_err().http_status(), 409);
    }

    #[test]
    fn audit_export_is_public_only() {
        let (store, id) = closed_election();
        store
            .with_election(id, |r| {
                r.append_audit("note", json!({"private": true}), false, Utc::now());
                Ok(())
            })
            .unwrap();
        let export = public_audit_export(&store, id).unwrap();
        assert!(export.entries.iter().all(|e| e.event_type != "note"));
        let types: Vec<&str> = export.entries.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                EVENT_BALLOT_SUBMITTED,
                EVENT_BALLOT_SUBMITTED,
                EVENT_BALLOT_SUBMITTED,
                EVENT_ELECTION_ANONYMIZED,
                EVENT_ELECTION_CLOSED
            ]
        );
        for e in export.entries.iter() {
            assert!(e.payload.get("ranking").is_none());
            assert!(chrono::DateTime::parse_from_rfc3339(&e.timestamp).is_ok());
        }
    }

    #[test]
    fn tally_json_uses_exact_strings() {
        let mut b = Builder::new(&TallyRules::default(), 1)
            .unwrap()
            .candidates(&["A".to_string(), "B".to_string()])
            .unwrap();
        b.add_vote(&["A".to_string()], 2).unwrap();
        b.add_vote(&["B".to_string()], 1).unwrap();
        let result = b.tally().unwrap();
        let js = tally_result_to_json(&result);
        assert_eq!(js["quota"], json!("1.5"));
        assert_eq!(js["elected"], json!([1]));
        let round = &js["rounds"][0];
        assert_eq!(round["iteration"], json!(1));
        assert_eq!(round["retained_totals"]["1"], json!("2"));
        assert_eq!(round["count_complete"], json!(true));
        assert!(round["eliminated"].is_null());
        assert!(round["audit_text"].as_str().unwrap().starts_with("Iteration 1 summary"));
    }
}
