//! The commands of the command line tool.

use std::collections::HashMap;
use std::fs;

use log::{debug, info, warn};
use serde_json::{json, Map as JSMap, Value as JSValue};
use snafu::prelude::*;
use text_diff::print_diff;

use crate::elections::ballots::{quorum_status_of, submit_ballot};
use crate::elections::config_reader::{read_summary, ScenarioFile, ScenarioVote, Settings, TallyFile};
use crate::elections::export::{
    public_audit_export, public_ballots_export, tally_result_to_json, verify_ballots_export, PublicBallotsExport,
};
use crate::elections::lifecycle::*;
use crate::elections::notifications::{CredentialEmail, ReceiptEmail};
use crate::elections::store::ElectionStore;
use crate::elections::*;

/// Writes to the given file, or to the standard output for `None` or `stdout`.
fn write_output(js: &JSValue, out: Option<&str>) -> ElectionResult<String> {
    let pretty = serde_json::to_string_pretty(js).context(ParsingJsonSnafu {})?;
    match out {
        None | Some("stdout") => println!("{}", pretty),
        Some(path) => {
            fs::write(path, &pretty).context(WritingOutputSnafu { path })?;
            info!("write_output: wrote {}", path);
        }
    }
    Ok(pretty)
}

fn compare_with_reference(pretty_js_stats: &str, reference_path: &str) -> ElectionResult<()> {
    let summary_ref = read_summary(reference_path)?;
    let pretty_js_summary_ref = serde_json::to_string_pretty(&summary_ref).context(ParsingJsonSnafu {})?;
    if pretty_js_summary_ref != pretty_js_stats {
        warn!("Found differences with the reference result");
        print_diff(pretty_js_summary_ref.as_str(), pretty_js_stats, "\n");
        whatever!("Difference detected between the computed result and the reference result")
    }
    Ok(())
}

// ********* tally ***********

pub fn tally_file(tf: &TallyFile) -> ElectionResult<JSValue> {
    let rules = tf.rules()?;
    let result = meek_stv::run_meek_tally(
        &tf.engine_ballots(),
        &tf.engine_candidates(),
        tf.seats,
        &tf.engine_groups(),
        &rules,
    )?;
    let mut names: JSMap<String, JSValue> = JSMap::new();
    for c in tf.candidates.iter() {
        names.insert(c.id.to_string(), json!(c.name));
    }
    Ok(json!({
        "name": tf.name,
        "seats": tf.seats,
        "candidates": names,
        "result": tally_result_to_json(&result),
    }))
}

pub fn run_tally(input: &str, out: Option<&str>, reference: Option<&str>) -> ElectionResult<()> {
    let tf = TallyFile::from_file(input)?;
    info!(
        "run_tally: {:?}: {} candidates, {} ballots",
        tf.name,
        tf.candidates.len(),
        tf.ballots.len()
    );
    let js = tally_file(&tf)?;
    let pretty = write_output(&js, out)?;
    if let Some(reference_path) = reference {
        compare_with_reference(&pretty, reference_path)?;
    }
    Ok(())
}

// ********* verify-chain ***********

pub fn run_verify_chain(input: &str) -> ElectionResult<String> {
    let export = PublicBallotsExport::from_file(input)?;
    let head = verify_ballots_export(&export)?;
    println!(
        "Chain of election {} verified: {} ballots, head {}",
        export.election_id,
        export.ballots.len(),
        head
    );
    Ok(head)
}

// ********* simulate ***********

fn candidate_id(ids: &HashMap<String, CandidateId>, username: &str) -> ElectionResult<CandidateId> {
    ids.get(username.trim())
        .cloned()
        .ok_or_else(|| ElectionError::InvalidRanking {
            message: format!("{:?} is not a candidate", username),
        })
}

fn cast_vote(
    store: &ElectionStore,
    election_id: ElectionId,
    ids: &HashMap<String, CandidateId>,
    vote: &ScenarioVote,
    now: chrono::DateTime<chrono::Utc>,
) -> ElectionResult<BallotReceipt> {
    let username = vote.username.trim();
    let public_id = store
        .with_election(election_id, |record| {
            Ok(record
                .credentials
                .iter()
                .find(|c| c.freeipa_username.as_deref() == Some(username))
                .map(|c| c.public_id.clone()))
        })?
        .ok_or(ElectionError::VoterIneligible { election_id })?;
    let ranking = vote
        .ranking
        .iter()
        .map(|u| candidate_id(ids, u))
        .collect::<ElectionResult<Vec<CandidateId>>>()?;
    submit_ballot(store, election_id, &public_id, username, &ranking, now)
}

/// Replays a scenario from draft to tally, at the times planned in its draft.
pub fn simulate(scenario: &ScenarioFile, settings: &Settings) -> ElectionResult<JSValue> {
    let store = ElectionStore::new();
    let draft = &scenario.election;
    let id = create_election(&store, draft)?;

    let mut ids: HashMap<String, CandidateId> = HashMap::new();
    for c in scenario.candidates.iter() {
        let record = add_candidate(&store, id, &c.username, &c.nominated_by, &c.description)?;
        ids.insert(record.freeipa_username, record.id);
    }
    for g in scenario.exclusion_groups.iter() {
        let members = g
            .candidates
            .iter()
            .map(|u| candidate_id(&ids, u))
            .collect::<ElectionResult<Vec<CandidateId>>>()?;
        add_exclusion_group(&store, id, &g.name, g.max_elected, &members)?;
    }

    let opened_at = draft.start_datetime;
    let issued = start_election(&store, id, &scenario.directory, settings, opened_at)?;
    let election = store.snapshot(id)?.election;
    let credential_emails: Vec<CredentialEmail> = issued
        .iter()
        .filter_map(|c| CredentialEmail::new(&election, c, settings))
        .collect();

    let mut receipt_emails: Vec<ReceiptEmail> = Vec::new();
    let mut rejected = 0_u64;
    for vote in scenario.votes.iter() {
        match cast_vote(&store, id, &ids, vote, opened_at) {
            Ok(receipt) => receipt_emails.push(ReceiptEmail::new(&election, &receipt, settings)),
            Err(e) => {
                warn!("simulate: vote rejected: {} ({})", e, e.code());
                rejected += 1;
            }
        }
    }
    debug!(
        "simulate: {} credential emails, {} receipt emails",
        credential_emails.len(),
        receipt_emails.len()
    );

    close_election(&store, id, draft.end_datetime)?;
    tally_election(&store, id, settings, draft.end_datetime)?;

    let ballots = public_ballots_export(&store, id)?;
    verify_ballots_export(&ballots)?;
    let audit = public_audit_export(&store, id)?;
    let snapshot = store.snapshot(id)?;
    Ok(json!({
        "election_id": id,
        "name": snapshot.election.name,
        "quorum": quorum_status_of(&snapshot).to_json(),
        "rejected_votes": rejected,
        "credential_emails": credential_emails.len(),
        "receipt_emails": receipt_emails.len(),
        "result": snapshot.election.tally_result,
        "ballots": serde_json::to_value(&ballots).context(ParsingJsonSnafu {})?,
        "audit": serde_json::to_value(&audit).context(ParsingJsonSnafu {})?,
    }))
}

pub fn run_simulate(input: &str, settings_path: Option<&str>, out: Option<&str>) -> ElectionResult<()> {
    let scenario = ScenarioFile::from_file(input)?;
    let settings = match settings_path {
        Some(p) => Settings::from_file(p)?,
        None => Settings::default(),
    };
    let js = simulate(&scenario, &settings)?;
    write_output(&js, out)?;
    Ok(())
}
