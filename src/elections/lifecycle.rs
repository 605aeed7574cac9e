//! The state machine of an election: draft, open, closed, tallied.
//!
//! Every transition runs under the lock of the election and validates all its
//! preconditions before it writes anything.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use meek_stv::{Ballot, Candidate, ExclusionGroup, TallyResult};
use serde_json::json;
use snafu::prelude::*;
use uuid::Uuid;

use crate::elections::ballots::quorum_status_of;
use crate::elections::config_reader::Settings;
use crate::elections::credentials::{issue_from_memberships_locked, MembershipDirectory};
use crate::elections::export::tally_result_to_json;
use crate::elections::ledger::verify_ballot_records;
use crate::elections::store::{ElectionRecord, ElectionStore};
use crate::elections::*;

// ********* Drafts ***********

fn validate_draft(draft: &ElectionDraft) -> ElectionResult<()> {
    ensure!(
        !draft.name.trim().is_empty(),
        ValidationSnafu {
            message: "an election needs a name"
        }
    );
    ensure!(
        draft.number_of_seats >= 1,
        ValidationSnafu {
            message: "an election needs at least one seat"
        }
    );
    ensure!(
        draft.end_datetime > draft.start_datetime,
        ValidationSnafu {
            message: "the end of an election must come after its start"
        }
    );
    ensure!(
        draft.quorum <= 100,
        ValidationSnafu {
            message: format!("quorum {}% is not a percentage", draft.quorum)
        }
    );
    Ok(())
}

fn clean_group(cn: &Option<String>) -> Option<String> {
    cn.as_deref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn create_election(store: &ElectionStore, draft: &ElectionDraft) -> ElectionResult<ElectionId> {
    validate_draft(draft)?;
    let id = store.next_election_id();
    store.insert(Election {
        id,
        name: draft.name.trim().to_string(),
        description: draft.description.clone(),
        start_datetime: draft.start_datetime,
        end_datetime: draft.end_datetime,
        number_of_seats: draft.number_of_seats,
        quorum: draft.quorum,
        status: ElectionStatus::Draft,
        tally_result: None,
        eligible_group_cn: clean_group(&draft.eligible_group_cn),
    });
    info!("create_election: election {} ({:?})", id, draft.name.trim());
    Ok(id)
}

pub fn update_draft(store: &ElectionStore, election_id: ElectionId, draft: &ElectionDraft) -> ElectionResult<()> {
    store.with_election(election_id, |record| {
        record.require_status("edit", &[ElectionStatus::Draft])?;
        validate_draft(draft)?;
        let e = &mut record.election;
        e.name = draft.name.trim().to_string();
        e.description = draft.description.clone();
        e.start_datetime = draft.start_datetime;
        e.end_datetime = draft.end_datetime;
        e.number_of_seats = draft.number_of_seats;
        e.quorum = draft.quorum;
        e.eligible_group_cn = clean_group(&draft.eligible_group_cn);
        Ok(())
    })
}

/// Adds a candidate. The tie-break identifier is drawn here and never changes.
pub fn add_candidate(
    store: &ElectionStore,
    election_id: ElectionId,
    username: &str,
    nominated_by: &str,
    description: &str,
) -> ElectionResult<CandidateRecord> {
    store.with_election(election_id, |record| {
        record.require_status("add candidates", &[ElectionStatus::Draft])?;
        let username = username.trim();
        ensure!(
            !username.is_empty(),
            ValidationSnafu {
                message: "a candidate needs a username"
            }
        );
        ensure!(
            !record.candidates.iter().any(|c| c.freeipa_username == username),
            ValidationSnafu {
                message: format!("{} is already a candidate", username)
            }
        );
        let candidate = CandidateRecord {
            id: record.next_row_id(),
            election_id,
            freeipa_username: username.to_string(),
            nominated_by: nominated_by.trim().to_string(),
            description: description.to_string(),
            tiebreak_uuid: Uuid::new_v4(),
        };
        record.candidates.push(candidate.clone());
        Ok(candidate)
    })
}

pub fn add_exclusion_group(
    store: &ElectionStore,
    election_id: ElectionId,
    name: &str,
    max_elected: u32,
    candidate_ids: &[CandidateId],
) -> ElectionResult<ExclusionGroupRecord> {
    store.with_election(election_id, |record| {
        record.require_status("add exclusion groups", &[ElectionStatus::Draft])?;
        ensure!(
            max_elected >= 1,
            ValidationSnafu {
                message: "an exclusion group must allow at least one winner"
            }
        );
        let mut members: Vec<CandidateId> = Vec::new();
        for cid in candidate_ids.iter() {
            ensure!(
                record.candidates.iter().any(|c| c.id == *cid),
                ValidationSnafu {
                    message: format!("candidate {} does not stand in this election", cid)
                }
            );
            if !members.contains(cid) {
                members.push(*cid);
            }
        }
        let group = ExclusionGroupRecord {
            id: record.next_row_id(),
            public_id: Uuid::new_v4().to_string(),
            election_id,
            name: name.trim().to_string(),
            max_elected,
            candidate_ids: members,
        };
        record.exclusion_groups.push(group.clone());
        Ok(group)
    })
}

// ********* Transitions ***********

/// Opens the election and issues the credentials of every eligible voter.
///
/// The start of the election becomes `now`, and eligibility is evaluated
/// against it.
pub fn start_election(
    store: &ElectionStore,
    election_id: ElectionId,
    directory: &dyn MembershipDirectory,
    settings: &Settings,
    now: DateTime<Utc>,
) -> ElectionResult<Vec<VotingCredential>> {
    store.with_election(election_id, |record| {
        record.require_status("start", &[ElectionStatus::Draft])?;
        ensure!(
            !record.candidates.is_empty(),
            ValidationSnafu {
                message: "an election needs at least one candidate to start"
            }
        );
        ensure!(
            record.election.end_datetime > now,
            ValidationSnafu {
                message: "the end of the election is already past"
            }
        );

        // Issuance runs on a copy, swapped in once everything succeeded.
        let mut staged: ElectionRecord = record.clone();
        staged.election.start_datetime = now;
        let issued = issue_from_memberships_locked(&mut staged, directory, settings, now)?;
        staged.election.status = ElectionStatus::Open;
        staged.append_audit(
            EVENT_ELECTION_STARTED,
            json!({
                "start_datetime": now.to_rfc3339(),
                "end_datetime": staged.election.end_datetime.to_rfc3339(),
                "credentials_issued": issued.len(),
            }),
            true,
            now,
        );
        *record = staged;
        info!(
            "start_election: election {} open with {} credentials",
            election_id,
            issued.len()
        );
        Ok(issued)
    })
}

/// Moves the end of an open election later.
pub fn extend_end(
    store: &ElectionStore,
    election_id: ElectionId,
    new_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ElectionResult<()> {
    store.with_election(election_id, |record| {
        if record.election.status != ElectionStatus::Open {
            return Err(ElectionError::ElectionNotOpen { election_id });
        }
        let previous_end = record.election.end_datetime;
        ensure!(
            new_end > previous_end,
            ValidationSnafu {
                message: "the new end must be later than the current end"
            }
        );
        ensure!(
            new_end > now,
            ValidationSnafu {
                message: "the new end must be in the future"
            }
        );
        record.election.end_datetime = new_end;

        let mut payload = quorum_status_of(record).to_json();
        payload["previous_end_datetime"] = json!(previous_end.to_rfc3339());
        payload["new_end_datetime"] = json!(new_end.to_rfc3339());
        record.append_audit(EVENT_ELECTION_END_EXTENDED, payload, true, now);
        info!("extend_end: election {} now ends at {}", election_id, new_end);
        Ok(())
    })
}

/// Closes the voting and anonymizes the credentials. Returns the final chain head.
pub fn close_election(store: &ElectionStore, election_id: ElectionId, now: DateTime<Utc>) -> ElectionResult<String> {
    store.with_election(election_id, |record| {
        record.require_status("close", &[ElectionStatus::Open])?;
        let head = verify_ballot_records(election_id, &record.ballots)?;
        if head != record.chain_head {
            error!(
                "close_election: election {}: stored head {} does not match {}",
                election_id, record.chain_head, head
            );
            return Err(ElectionError::ChainIntegrity {
                election_id,
                position: record.ballots.len(),
                detail: format!("stored chain head {} should be {}", record.chain_head, head),
            });
        }

        record.election.status = ElectionStatus::Closed;
        if record.election.end_datetime > now {
            record.election.end_datetime = now;
        }
        let mut credentials_affected = 0_u64;
        for c in record.credentials.iter_mut() {
            if c.freeipa_username.take().is_some() {
                credentials_affected += 1;
            }
        }
        record.append_audit(
            EVENT_ELECTION_ANONYMIZED,
            json!({ "credentials_affected": credentials_affected }),
            true,
            now,
        );
        record.append_audit(EVENT_ELECTION_CLOSED, json!({ "chain_head": head }), true, now);
        info!(
            "close_election: election {} closed, {} ballots, chain head {}",
            election_id,
            record.ballots.len(),
            head
        );
        Ok(head)
    })
}

fn engine_input(record: &ElectionRecord) -> (Vec<Candidate>, Vec<ExclusionGroup>, Vec<Ballot>) {
    let candidates = record
        .candidates
        .iter()
        .map(|c| Candidate {
            id: c.id,
            name: c.freeipa_username.clone(),
            tiebreak_uuid: c.tiebreak_uuid,
        })
        .collect();
    let groups = record
        .exclusion_groups
        .iter()
        .map(|g| ExclusionGroup {
            public_id: g.public_id.clone(),
            name: g.name.clone(),
            max_elected: g.max_elected,
            candidate_ids: g.candidate_ids.clone(),
        })
        .collect();
    let ballots = record
        .counted_ballots()
        .map(|b| Ballot {
            ranking: b.ranking.clone(),
            weight: b.weight,
        })
        .collect();
    (candidates, groups, ballots)
}

/// Counts a closed election and stores the result.
///
/// Nothing is stored if the count fails.
pub fn tally_election(
    store: &ElectionStore,
    election_id: ElectionId,
    settings: &Settings,
    now: DateTime<Utc>,
) -> ElectionResult<TallyResult> {
    store.with_election(election_id, |record| {
        record.require_status("tally", &[ElectionStatus::Closed])?;
        let rules = settings.tally_rules()?;
        let (candidates, groups, ballots) = engine_input(record);
        info!(
            "tally_election: election {}: {} counted ballots, {} candidates, {} seats",
            election_id,
            ballots.len(),
            candidates.len(),
            record.election.number_of_seats
        );
        let result = meek_stv::run_meek_tally(
            &ballots,
            &candidates,
            record.election.number_of_seats,
            &groups,
            &rules,
        )
        .map_err(|e| {
            error!("tally_election: election {}: {}", election_id, e);
            ElectionError::from(e)
        })?;

        let js = tally_result_to_json(&result);
        if let Some(rounds) = js["rounds"].as_array() {
            for round in rounds.iter() {
                let mut payload = round.clone();
                payload["round"] = round["iteration"].clone();
                record.append_audit(EVENT_TALLY_ROUND, payload, true, now);
            }
        } else {
            warn!("tally_election: election {}: no rounds to record", election_id);
        }
        record.append_audit(
            EVENT_TALLY_COMPLETED,
            json!({
                "quota": js["quota"],
                "elected": js["elected"],
                "eliminated": js["eliminated"],
                "forced_excluded": js["forced_excluded"],
                "method": "meek",
            }),
            true,
            now,
        );
        record.election.tally_result = Some(js);
        record.election.status = ElectionStatus::Tallied;
        info!(
            "tally_election: election {}: elected {:?}",
            election_id, result.elected
        );
        Ok(result)
    })
}

/// Soft delete. The election disappears from every other operation.
pub fn delete_election(store: &ElectionStore, election_id: ElectionId) -> ElectionResult<()> {
    store.with_election(election_id, |record| {
        record.election.status = ElectionStatus::Deleted;
        info!("delete_election: election {}", election_id);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elections::ballots::submit_ballot;
    use crate::elections::credentials::{InMemoryDirectory, MembershipRecord, MembershipType};
    use crate::elections::ledger::genesis_hash;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn draft(seats: u32) -> ElectionDraft {
        ElectionDraft {
            name: "Board of directors".to_string(),
            description: String::new(),
            start_datetime: t0(),
            end_datetime: t0() + Duration::days(14),
            number_of_seats: seats,
            quorum: 0,
            eligible_group_cn: None,
        }
    }

    fn directory(voters: &[(&str, u64)]) -> InMemoryDirectory {
        InMemoryDirectory {
            memberships: voters
                .iter()
                .map(|(u, votes)| MembershipRecord {
                    username: u.to_string(),
                    membership_type: MembershipType {
                        code: "individual".to_string(),
                        votes: *votes,
                        is_individual: true,
                        enabled: true,
                    },
                    created_at: t0() - Duration::days(365),
                    expires_at: None,
                })
                .collect(),
            groups: Vec::new(),
        }
    }

    fn credential(store: &ElectionStore, id: ElectionId, username: &str) -> String {
        store
            .snapshot(id)
            .unwrap()
            .credentials
            .iter()
            .find(|c| c.freeipa_username.as_deref() == Some(username))
            .unwrap()
            .public_id
            .clone()
    }

    #[test]
    fn draft_validation() {
        let store = ElectionStore::new();
        assert!(create_election(&store, &draft(0)).is_err());
        let mut bad = draft(1);
        bad.end_datetime = bad.start_datetime;
        assert!(create_election(&store, &bad).is_err());
        bad = draft(1);
        bad.quorum = 101;
        assert!(create_election(&store, &bad).is_err());

        let id = create_election(&store, &draft(1)).unwrap();
        let mut changed = draft(2);
        changed.eligible_group_cn = Some("  ".to_string());
        update_draft(&store, id, &changed).unwrap();
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.election.number_of_seats, 2);
        assert_eq!(snap.election.eligible_group_cn, None);

        let a = add_candidate(&store, id, "ann", "bob", "").unwrap();
        assert!(add_candidate(&store, id, " ann ", "bob", "").is_err());
        assert!(add_exclusion_group(&store, id, "Employer", 0, &[a.id]).is_err());
        assert!(add_exclusion_group(&store, id, "Employer", 1, &[a.id + 100]).is_err());
        let g = add_exclusion_group(&store, id, "Employer", 1, &[a.id, a.id]).unwrap();
        assert_eq!(g.candidate_ids, vec![a.id]);
    }

    #[test]
    fn start_issues_credentials() {
        let store = ElectionStore::new();
        let id = create_election(&store, &draft(1)).unwrap();
        let d = directory(&[("alice", 1), ("bob", 2)]);
        let err = start_election(&store, id, &d, &Settings::default(), t0()).unwrap_err();
        assert_eq!(err.code(), "validation");

        add_candidate(&store, id, "ann", "alice", "").unwrap();
        let now = t0() + Duration::hours(1);
        let issued = start_election(&store, id, &d, &Settings::default(), now).unwrap();
        assert_eq!(issued.len(), 2);
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.election.status, ElectionStatus::Open);
        assert_eq!(snap.election.start_datetime, now);
        assert_eq!(snap.audit_events(EVENT_ELECTION_STARTED).len(), 1);

        let err = add_candidate(&store, id, "ben", "alice", "").unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert!(start_election(&store, id, &d, &Settings::default(), now).is_err());
    }

    #[test]
    fn extend_only_later() {
        let store = ElectionStore::new();
        let id = create_election(&store, &draft(1)).unwrap();
        let end = t0() + Duration::days(14);
        let err = extend_end(&store, id, end + Duration::days(1), t0()).unwrap_err();
        assert_eq!(err.code(), "election_not_open");

        add_candidate(&store, id, "ann", "alice", "").unwrap();
        start_election(&store, id, &directory(&[("alice", 1)]), &Settings::default(), t0()).unwrap();
        assert!(extend_end(&store, id, end - Duration::days(1), t0()).is_err());
        extend_end(&store, id, end + Duration::days(1), t0()).unwrap();
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.election.end_datetime, end + Duration::days(1));
        let entry = &snap.audit_events(EVENT_ELECTION_END_EXTENDED)[0];
        assert_eq!(entry.payload["previous_end_datetime"], json!(end.to_rfc3339()));
        assert_eq!(entry.payload["eligible_voter_count"], json!(1));
    }

    #[test]
    fn full_lifecycle() {
        let store = ElectionStore::new();
        let id = create_election(&store, &draft(2)).unwrap();
        let a = add_candidate(&store, id, "ann", "x", "").unwrap().id;
        let b = add_candidate(&store, id, "ben", "x", "").unwrap().id;
        let c = add_candidate(&store, id, "cyd", "x", "").unwrap().id;
        add_exclusion_group(&store, id, "Acme", 1, &[a, b]).unwrap();
        let voters = ["v1", "v2", "v3", "v4", "v5", "v6"];
        let d = directory(&voters.iter().map(|v| (*v, 1)).collect::<Vec<(&str, u64)>>());
        start_election(&store, id, &d, &Settings::default(), t0()).unwrap();

        let err = tally_election(&store, id, &Settings::default(), t0()).unwrap_err();
        assert_eq!(err.code(), "election_state");

        let rankings = [vec![a, b, c], vec![a, b, c], vec![b, a, c], vec![b, a, c], vec![c], vec![c, a]];
        for (v, r) in voters.iter().zip(rankings.iter()) {
            let cred = credential(&store, id, v);
            submit_ballot(&store, id, &cred, v, r, t0() + Duration::hours(1)).unwrap();
        }

        let close_time = t0() + Duration::days(1);
        let head = close_election(&store, id, close_time).unwrap();
        let snap = store.snapshot(id).unwrap();
        assert_eq!(head, snap.chain_head);
        assert_ne!(head, genesis_hash(id));
        assert_eq!(snap.election.end_datetime, close_time);
        assert!(snap.credentials.iter().all(|c| c.freeipa_username.is_none()));
        assert_eq!(
            snap.audit_events(EVENT_ELECTION_ANONYMIZED)[0].payload,
            json!({ "credentials_affected": 6 })
        );
        assert_eq!(
            snap.audit_events(EVENT_ELECTION_CLOSED)[0].payload,
            json!({ "chain_head": head })
        );

        let result = tally_election(&store, id, &Settings::default(), close_time).unwrap();
        assert_eq!(result.elected.len(), 2);
        assert!(result.elected.contains(&c));
        assert_eq!(result.elected.iter().filter(|x| **x == a || **x == b).count(), 1);

        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.election.status, ElectionStatus::Tallied);
        let rounds = snap.audit_events(EVENT_TALLY_ROUND);
        assert_eq!(rounds.len(), result.rounds.len());
        assert_eq!(rounds[0].payload["round"], json!(1));
        assert!(rounds
            .iter()
            .any(|r| r.payload["audit_text"].as_str().unwrap_or("").contains("Acme")));
        let done = snap.audit_events(EVENT_TALLY_COMPLETED);
        assert_eq!(done[0].payload["method"], json!("meek"));
        assert_eq!(snap.election.tally_result.as_ref().unwrap()["elected"], done[0].payload["elected"]);
        assert!(tally_election(&store, id, &Settings::default(), close_time).is_err());
    }

    #[test]
    fn failed_tally_stores_nothing() {
        let store = ElectionStore::new();
        let id = create_election(&store, &draft(1)).unwrap();
        let a = add_candidate(&store, id, "ann", "x", "").unwrap().id;
        add_candidate(&store, id, "ben", "x", "").unwrap();
        start_election(&store, id, &directory(&[("v1", 1)]), &Settings::default(), t0()).unwrap();
        let cred = credential(&store, id, "v1");
        submit_ballot(&store, id, &cred, "v1", &[a], t0()).unwrap();
        close_election(&store, id, t0()).unwrap();

        let broken = Settings {
            tally_max_iterations: Some(0),
            ..Settings::default()
        };
        assert!(tally_election(&store, id, &broken, t0()).is_err());
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.election.status, ElectionStatus::Closed);
        assert!(snap.election.tally_result.is_none());
        assert!(snap.audit_events(EVENT_TALLY_ROUND).is_empty());
    }

    #[test]
    fn tampering_blocks_close() {
        let store = ElectionStore::new();
        let id = create_election(&store, &draft(1)).unwrap();
        let a = add_candidate(&store, id, "ann", "x", "").unwrap().id;
        start_election(&store, id, &directory(&[("v1", 1)]), &Settings::default(), t0()).unwrap();
        let cred = credential(&store, id, "v1");
        submit_ballot(&store, id, &cred, "v1", &[a], t0()).unwrap();
        store
            .with_election(id, |r| {
                r.ballots[0].weight = 50;
                Ok(())
            })
            .unwrap();
        let err = close_election(&store, id, t0()).unwrap_err();
        assert_eq!(err.code(), "chain_integrity_failure");
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.election.status, ElectionStatus::Open);
        assert!(snap.credentials[0].freeipa_username.is_some());
    }

    #[test]
    fn deleted_elections_disappear() {
        let store = ElectionStore::new();
        let id = create_election(&store, &draft(1)).unwrap();
        delete_election(&store, id).unwrap();
        assert_eq!(add_candidate(&store, id, "ann", "x", "").unwrap_err().code(), "election_not_found");
        assert!(delete_election(&store, id).is_err());
    }
}
