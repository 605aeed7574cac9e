//! Payloads handed to the mail service. Delivery happens elsewhere.

use serde::Serialize;

use crate::elections::config_reader::Settings;
use crate::elections::*;

fn base_url(settings: &Settings) -> &str {
    settings.public_base_url.trim_end_matches('/')
}

pub fn ballot_verify_url(settings: &Settings, ballot_hash: &str) -> String {
    format!("{}/elections/ballot/verify?receipt={}", base_url(settings), ballot_hash)
}

pub fn election_vote_url(settings: &Settings, election_id: ElectionId) -> String {
    format!("{}/elections/{}/vote", base_url(settings), election_id)
}

/// The credential travels in the fragment, which browsers never send to the server.
pub fn election_vote_url_with_credential(settings: &Settings, election_id: ElectionId, public_id: &str) -> String {
    format!("{}#credential={}", election_vote_url(settings, election_id), public_id)
}

/// Sent after a ballot was recorded.
#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub struct ReceiptEmail {
    pub election_id: ElectionId,
    pub election_name: String,
    pub ballot_hash: String,
    pub nonce: String,
    pub previous_chain_hash: String,
    pub chain_hash: String,
    pub verify_url: String,
}

impl ReceiptEmail {
    pub fn new(election: &Election, receipt: &BallotReceipt, settings: &Settings) -> ReceiptEmail {
        ReceiptEmail {
            election_id: election.id,
            election_name: election.name.clone(),
            ballot_hash: receipt.ballot_hash.clone(),
            nonce: receipt.nonce.clone(),
            previous_chain_hash: receipt.previous_chain_hash.clone(),
            chain_hash: receipt.chain_hash.clone(),
            verify_url: ballot_verify_url(settings, &receipt.ballot_hash),
        }
    }
}

/// Sent when a credential is issued.
#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub struct CredentialEmail {
    pub username: String,
    pub election_id: ElectionId,
    pub election_name: String,
    pub credential_public_id: String,
    pub weight: u64,
    pub vote_url: String,
    pub vote_url_with_credential: String,
}

impl CredentialEmail {
    /// None once the credential was anonymized.
    pub fn new(election: &Election, credential: &VotingCredential, settings: &Settings) -> Option<CredentialEmail> {
        let username = credential.freeipa_username.clone()?;
        Some(CredentialEmail {
            username,
            election_id: election.id,
            election_name: election.name.clone(),
            credential_public_id: credential.public_id.clone(),
            weight: credential.weight,
            vote_url: election_vote_url(settings, election.id),
            vote_url_with_credential: election_vote_url_with_credential(settings, election.id, &credential.public_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn election() -> Election {
        let now = Utc::now();
        Election {
            id: 12,
            name: "Board".to_string(),
            description: String::new(),
            start_datetime: now,
            end_datetime: now + Duration::days(1),
            number_of_seats: 1,
            quorum: 0,
            status: ElectionStatus::Open,
            tally_result: None,
            eligible_group_cn: None,
        }
    }

    fn settings() -> Settings {
        Settings {
            public_base_url: "https://vote.example.org/".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn receipt_email() {
        let receipt = BallotReceipt {
            ballot_id: 3,
            ballot_hash: "aa".repeat(32),
            nonce: "n".to_string(),
            previous_chain_hash: "bb".repeat(32),
            chain_hash: "cc".repeat(32),
        };
        let email = ReceiptEmail::new(&election(), &receipt, &settings());
        assert_eq!(
            email.verify_url,
            format!("https://vote.example.org/elections/ballot/verify?receipt={}", "aa".repeat(32))
        );
        let js = serde_json::to_value(&email).unwrap();
        assert!(js.get("ranking").is_none());
        assert_eq!(js["nonce"], serde_json::json!("n"));
    }

    #[test]
    fn credential_email() {
        let mut credential = VotingCredential {
            id: 1,
            election_id: 12,
            public_id: "abc".to_string(),
            freeipa_username: Some("alice".to_string()),
            weight: 2,
            created_at: Utc::now(),
        };
        let email = CredentialEmail::new(&election(), &credential, &settings()).unwrap();
        assert_eq!(email.vote_url, "https://vote.example.org/elections/12/vote");
        assert_eq!(
            email.vote_url_with_credential,
            "https://vote.example.org/elections/12/vote#credential=abc"
        );
        credential.freeipa_username = None;
        assert!(CredentialEmail::new(&election(), &credential, &settings()).is_none());
    }
}
