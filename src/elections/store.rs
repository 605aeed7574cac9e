//! In-memory storage of elections.
//!
//! Each election lives behind its own mutex. Every operation that touches an
//! election holds that lock for its whole duration, which serializes the
//! ballot chain of one election without blocking the others.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JSValue;

use crate::elections::ledger::genesis_hash;
use crate::elections::*;

/// Everything stored for one election.
#[derive(PartialEq, Debug, Clone)]
pub struct ElectionRecord {
    pub election: Election,
    pub candidates: Vec<CandidateRecord>,
    pub exclusion_groups: Vec<ExclusionGroupRecord>,
    pub credentials: Vec<VotingCredential>,
    /// In submission order, superseded ballots included.
    pub ballots: Vec<BallotRecord>,
    pub audit_log: Vec<AuditLogEntry>,
    /// `chain_hash` of the last ballot, or the genesis hash.
    pub chain_head: String,
    next_row_id: u64,
}

impl ElectionRecord {
    pub fn new(election: Election) -> ElectionRecord {
        ElectionRecord {
            chain_head: genesis_hash(election.id),
            election,
            candidates: Vec::new(),
            exclusion_groups: Vec::new(),
            credentials: Vec::new(),
            ballots: Vec::new(),
            audit_log: Vec::new(),
            next_row_id: 1,
        }
    }

    /// Identifiers of the rows attached to this election.
    pub fn next_row_id(&mut self) -> u64 {
        let id = self.next_row_id;
        self.next_row_id += 1;
        id
    }

    pub fn append_audit(&mut self, event_type: &str, payload: JSValue, is_public: bool, now: DateTime<Utc>) {
        let id = self.next_row_id();
        debug!(
            "append_audit: election {}: {} (public: {})",
            self.election.id, event_type, is_public
        );
        self.audit_log.push(AuditLogEntry {
            id,
            election_id: self.election.id,
            event_type: event_type.to_string(),
            payload,
            is_public,
            timestamp: now,
        });
    }

    pub fn counted_ballots(&self) -> impl Iterator<Item = &BallotRecord> {
        self.ballots.iter().filter(|b| b.is_counted())
    }

    pub fn ballot(&self, id: BallotId) -> Option<&BallotRecord> {
        self.ballots.iter().find(|b| b.id == id)
    }

    pub fn audit_events(&self, event_type: &str) -> Vec<&AuditLogEntry> {
        self.audit_log
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Fails unless the election is in one of `allowed`.
    pub fn require_status(&self, action: &str, allowed: &[ElectionStatus]) -> ElectionResult<()> {
        if allowed.contains(&self.election.status) {
            Ok(())
        } else {
            Err(ElectionError::ElectionState {
                election_id: self.election.id,
                action: action.to_string(),
                status: self.election.status,
            })
        }
    }
}

pub struct ElectionStore {
    elections: RwLock<BTreeMap<ElectionId, Arc<Mutex<ElectionRecord>>>>,
    next_election_id: AtomicU64,
}

impl Default for ElectionStore {
    fn default() -> Self {
        ElectionStore::new()
    }
}

impl ElectionStore {
    pub fn new() -> ElectionStore {
        ElectionStore {
            elections: RwLock::new(BTreeMap::new()),
            next_election_id: AtomicU64::new(1),
        }
    }

    pub fn next_election_id(&self) -> ElectionId {
        self.next_election_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, election: Election) -> ElectionId {
        let id = election.id;
        let record = Arc::new(Mutex::new(ElectionRecord::new(election)));
        self.elections.write().insert(id, record);
        id
    }

    fn handle(&self, election_id: ElectionId) -> ElectionResult<Arc<Mutex<ElectionRecord>>> {
        self.elections
            .read()
            .get(&election_id)
            .cloned()
            .ok_or(ElectionError::ElectionNotFound { election_id })
    }

    /// Runs `f` while holding the lock of the election. Deleted elections are not found.
    ///
    /// `f` must check everything before it starts mutating the record: an error
    /// returned after a mutation would leave it visible.
    pub fn with_election<T, F>(&self, election_id: ElectionId, f: F) -> ElectionResult<T>
    where
        F: FnOnce(&mut ElectionRecord) -> ElectionResult<T>,
    {
        let handle = self.handle(election_id)?;
        let mut record = handle.lock();
        if record.election.status == ElectionStatus::Deleted {
            return Err(ElectionError::ElectionNotFound { election_id });
        }
        f(&mut *record)
    }

    /// A copy of the current state of the election.
    pub fn snapshot(&self, election_id: ElectionId) -> ElectionResult<ElectionRecord> {
        self.with_election(election_id, |record| Ok(record.clone()))
    }

    pub fn election_ids(&self) -> Vec<ElectionId> {
        let handles: Vec<(ElectionId, Arc<Mutex<ElectionRecord>>)> = self
            .elections
            .read()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();
        handles
            .into_iter()
            .filter(|(_, h)| h.lock().election.status != ElectionStatus::Deleted)
            .map(|(id, _)| id)
            .collect()
    }

    /// Looks for a ballot by its hash, in all the elections.
    pub fn find_ballot_by_hash(&self, ballot_hash: &str) -> Option<(Election, BallotRecord)> {
        let wanted = ballot_hash.to_lowercase();
        for id in self.election_ids() {
            let found = self.with_election(id, |record| {
                Ok(record
                    .ballots
                    .iter()
                    .find(|b| b.ballot_hash == wanted)
                    .map(|b| (record.election.clone(), b.clone())))
            });
            if let Ok(Some(res)) = found {
                return Some(res);
            }
        }
        None
    }
}
