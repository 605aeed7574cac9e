//! The hash chain of ballot submissions.
//!
//! Every election has its own chain, rooted at a genesis hash derived from the
//! election id. Each submitted ballot (superseded or not) adds one link:
//! `chain_hash = sha256(previous_chain_hash || ballot_hash)`.

use log::error;
use serde_json::json;

use crate::elections::*;

const GENESIS_DOMAIN: &str = "astra-elections/ballot-chain/genesis/v1";

/// The root of the chain of an election.
pub fn genesis_hash(election_id: ElectionId) -> String {
    sha256::digest(format!("{}:{}", GENESIS_DOMAIN, election_id))
}

/// The content hash of a ballot.
///
/// The inputs are serialized as compact JSON with sorted keys, so the hash can
/// be recomputed by any party that knows them.
pub fn ballot_hash(
    election_id: ElectionId,
    credential_public_id: &str,
    ranking: &[CandidateId],
    weight: u64,
    nonce: &str,
) -> String {
    // serde_json maps keep their keys sorted.
    let canonical = json!({
        "credential_public_id": credential_public_id,
        "election_id": election_id,
        "nonce": nonce,
        "ranking": ranking,
        "weight": weight,
    })
    .to_string();
    sha256::digest(canonical)
}

pub fn chain_link(previous_chain_hash: &str, ballot_hash: &str) -> String {
    sha256::digest(format!("{}{}", previous_chain_hash, ballot_hash))
}

/// A fresh random nonce, 16 bytes hex-encoded.
pub fn fresh_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// True for a lowercase or uppercase 64 character hex string.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// The public part of a link of the chain.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ChainLink<'a> {
    pub ballot_hash: &'a str,
    pub previous_chain_hash: &'a str,
    pub chain_hash: &'a str,
}

impl<'a> From<&'a BallotRecord> for ChainLink<'a> {
    fn from(b: &'a BallotRecord) -> Self {
        ChainLink {
            ballot_hash: &b.ballot_hash,
            previous_chain_hash: &b.previous_chain_hash,
            chain_hash: &b.chain_hash,
        }
    }
}

/// Recomputes the chain from the genesis of the election and returns its head.
///
/// Any mismatch is a `ChainIntegrity` error. It is never repaired.
pub fn verify_chain<'a, I>(election_id: ElectionId, links: I) -> ElectionResult<String>
where
    I: IntoIterator<Item = ChainLink<'a>>,
{
    let mut head = genesis_hash(election_id);
    for (position, link) in links.into_iter().enumerate() {
        if link.previous_chain_hash != head {
            return chain_failure(
                election_id,
                position,
                format!(
                    "previous chain hash {} does not match {}",
                    link.previous_chain_hash, head
                ),
            );
        }
        let expected = chain_link(&head, link.ballot_hash);
        if link.chain_hash != expected {
            return chain_failure(
                election_id,
                position,
                format!("chain hash {} should be {}", link.chain_hash, expected),
            );
        }
        head = expected;
    }
    Ok(head)
}

/// Checks the stored ballots of an election: content hashes and chain links.
pub fn verify_ballot_records(election_id: ElectionId, ballots: &[BallotRecord]) -> ElectionResult<String> {
    for (position, b) in ballots.iter().enumerate() {
        let expected = ballot_hash(
            election_id,
            &b.credential_public_id,
            &b.ranking,
            b.weight,
            &b.nonce,
        );
        if b.ballot_hash != expected {
            return chain_failure(
                election_id,
                position,
                format!("ballot hash {} does not match its content", b.ballot_hash),
            );
        }
    }
    verify_chain(election_id, ballots.iter().map(ChainLink::from))
}

fn chain_failure<T>(election_id: ElectionId, position: usize, detail: String) -> ElectionResult<T> {
    error!(
        "verify_chain: election {}: chain broken at position {}: {}",
        election_id, position, detail
    );
    Err(ElectionError::ChainIntegrity {
        election_id,
        position,
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn record(election_id: ElectionId, previous: &str, ranking: &[CandidateId], nonce: &str) -> BallotRecord {
        let bh = ballot_hash(election_id, "cred", ranking, 1, nonce);
        BallotRecord {
            id: 1,
            election_id,
            credential_public_id: "cred".to_string(),
            ranking: ranking.to_vec(),
            weight: 1,
            nonce: nonce.to_string(),
            chain_hash: chain_link(previous, &bh),
            ballot_hash: bh,
            previous_chain_hash: previous.to_string(),
            superseded_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn genesis_is_per_election() {
        assert_eq!(genesis_hash(1), genesis_hash(1));
        assert_ne!(genesis_hash(1), genesis_hash(2));
        assert!(is_sha256_hex(&genesis_hash(1)));
    }

    #[test]
    fn ballot_hash_depends_on_every_input() {
        let base = ballot_hash(1, "c", &[1, 2], 1, "n");
        assert_eq!(base, ballot_hash(1, "c", &[1, 2], 1, "n"));
        assert_ne!(base, ballot_hash(2, "c", &[1, 2], 1, "n"));
        assert_ne!(base, ballot_hash(1, "d", &[1, 2], 1, "n"));
        assert_ne!(base, ballot_hash(1, "c", &[2, 1], 1, "n"));
        assert_ne!(base, ballot_hash(1, "c", &[1, 2], 2, "n"));
        assert_ne!(base, ballot_hash(1, "c", &[1, 2], 1, "m"));
    }

    #[test]
    fn nonces_are_fresh() {
        let a = fresh_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, fresh_nonce());
    }

    #[test]
    fn verifies_a_valid_chain() {
        let b1 = record(7, &genesis_hash(7), &[1], "a");
        let b2 = record(7, &b1.chain_hash, &[1], "b");
        let head = verify_ballot_records(7, &[b1, b2.clone()]).unwrap();
        assert_eq!(head, b2.chain_hash);
        assert_eq!(verify_chain(7, Vec::new()).unwrap(), genesis_hash(7));
    }

    #[test]
    fn detects_tampering() {
        let b1 = record(7, &genesis_hash(7), &[1], "a");
        let b2 = record(7, &b1.chain_hash, &[1], "b");

        let mut altered = b1.clone();
        altered.ranking = vec![2];
        let err = verify_ballot_records(7, &[altered, b2.clone()]).unwrap_err();
        assert_eq!(err.code(), "chain_integrity_failure");

        let removed = verify_ballot_records(7, &[b2.clone()]);
        assert!(matches!(removed, Err(ElectionError::ChainIntegrity { position: 0, .. })));
    }

    #[test]
    fn rejects_splicing_across_elections() {
        let b1 = record(7, &genesis_hash(7), &[1], "a");
        assert!(verify_chain(8, vec![ChainLink::from(&b1)]).is_err());
    }

    // Chains the submissions in order, the way the store appends them.
    fn chained(election_id: ElectionId, rows: &[(Vec<CandidateId>, u64, String)]) -> Vec<BallotRecord> {
        let mut head = genesis_hash(election_id);
        let mut res: Vec<BallotRecord> = Vec::new();
        for (idx, (ranking, weight, nonce)) in rows.iter().enumerate() {
            let credential = format!("cred-{}", idx % 3);
            let bh = ballot_hash(election_id, &credential, ranking, *weight, nonce);
            let chain_hash = chain_link(&head, &bh);
            res.push(BallotRecord {
                id: idx as BallotId + 1,
                election_id,
                credential_public_id: credential,
                ranking: ranking.clone(),
                weight: *weight,
                nonce: nonce.clone(),
                ballot_hash: bh,
                previous_chain_hash: head.clone(),
                chain_hash: chain_hash.clone(),
                superseded_by: None,
                created_at: Utc::now(),
            });
            head = chain_hash;
        }
        res
    }

    fn rows_strategy() -> impl Strategy<Value = Vec<(Vec<CandidateId>, u64, String)>> {
        prop::collection::vec(
            (
                prop::collection::vec(1u64..20, 1..6),
                1u64..10,
                "[0-9a-f]{32}",
            ),
            0..16,
        )
    }

    proptest! {
        #[test]
        fn genesis_hashes_are_distinct(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(genesis_hash(a) == genesis_hash(b), a == b);
            prop_assert!(is_sha256_hex(&genesis_hash(a)));
        }

        #[test]
        fn chain_rederives_from_genesis(election_id in 1u64..1000, rows in rows_strategy()) {
            let ballots = chained(election_id, &rows);
            let expected_head = ballots
                .last()
                .map(|b| b.chain_hash.clone())
                .unwrap_or_else(|| genesis_hash(election_id));
            prop_assert_eq!(verify_ballot_records(election_id, &ballots).unwrap(), expected_head);
            prop_assert!(verify_chain(election_id + 1, ballots.iter().map(ChainLink::from)).is_err() || ballots.is_empty());
        }

        #[test]
        fn any_altered_weight_breaks_the_chain(rows in rows_strategy(), pick in any::<prop::sample::Index>()) {
            prop_assume!(!rows.is_empty());
            let mut ballots = chained(3, &rows);
            let position = pick.index(ballots.len());
            ballots[position].weight += 1;
            let res = verify_ballot_records(3, &ballots);
            let broken_at_position = matches!(
                res,
                Err(ElectionError::ChainIntegrity { position: p, .. }) if p == position
            );
            prop_assert!(broken_at_position);
        }
    }
}
