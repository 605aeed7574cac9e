/*!
Plain-language explanations of the iterations of a count.

The texts are meant for voters and observers: they describe what happened in
each iteration without referring to the internals of the algorithm. They only
depend on the round record, the quota and the candidate names, so the same
round always produces the same text.
*/

use std::collections::HashMap;

use crate::config::*;
use crate::value::VoteValue;

/// The public texts for one iteration.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RoundExplanation {
    /// Multi-paragraph description of the iteration.
    pub audit_text: String,
    /// One line summary, e.g. `Iteration 2: elected Alice; count complete.`
    pub summary_text: String,
}

/// Builds the explanation of a round.
///
/// Candidates missing from `names` (or with an empty name) are reported as
/// unnamed candidates.
pub fn generate_round_explanation(
    round: &RoundRecord,
    quota: &VoteValue,
    names: &HashMap<CandidateId, String>,
) -> RoundExplanation {
    let fmt = Names { names };
    let mut paragraphs: Vec<String> = Vec::new();

    for tb in round.tie_breaks.iter() {
        paragraphs.push(explain_tie_break(tb, &fmt));
    }

    if !round.quota_reached.is_empty() {
        paragraphs.push(format!(
            "During this iteration, {} reached the election quota ({}).",
            fmt.candidates(&round.quota_reached),
            quota.to_fixed(4)
        ));
    }

    if !round.elected_by_quota.is_empty() {
        let who = fmt.candidates(&round.elected_by_quota);
        let many = round.elected_by_quota.len() > 1;
        paragraphs.push(format!(
            "{} {} elected by reaching the quota. To ensure a fair count, {} {} only the number of votes needed to reach the election quota. \
Any surplus votes are released and redistributed to remaining candidates based on voter preferences, as defined by the Meek STV method.",
            capitalize(&who),
            if many { "were" } else { "was" },
            who,
            if many { "retain" } else { "retains" },
        ));
    }

    if !round.elected_to_fill_remaining_seats.is_empty() {
        let who = fmt.candidates(&round.elected_to_fill_remaining_seats);
        let many = round.elected_to_fill_remaining_seats.len() > 1;
        let reason = if round.elected_total >= round.seats {
            "the remaining eligible candidates exactly filled the remaining seats under the election rules"
        } else {
            "no more candidates remained eligible than seats remained to be filled under the election rules"
        };
        paragraphs.push(format!(
            "{} {} elected because {}. This election did not depend on reaching the quota.",
            capitalize(&who),
            if many { "were" } else { "was" },
            reason
        ));
    }

    for (group_label, events) in group_exclusions(&round.forced_exclusions) {
        paragraphs.push(explain_exclusions(&group_label, &events, round, &fmt));
    }

    if let Some(cid) = round.eliminated {
        let who = fmt.candidate(cid);
        paragraphs.push(format!(
            "{} had the lowest vote total and was eliminated from the count. \
Votes for {} will be redistributed to remaining candidates according to voter preferences and current retention factors.",
            capitalize(&who),
            who
        ));
    }

    let mut eligible = round.eligible_candidates.clone();
    crate::sort_for_display(&mut eligible, names);
    if !round.numerically_converged && !round.count_complete && !eligible.is_empty() {
        paragraphs.push(format!(
            "{} {} eligible and will continue to receive redistributed votes.",
            capitalize(&fmt.candidates(&eligible)),
            if eligible.len() > 1 { "remain" } else { "remains" }
        ));
    }

    let nothing_happened = round.elected.is_empty()
        && round.eliminated.is_none()
        && round.forced_exclusions.is_empty();
    let remaining_seats = round.seats.saturating_sub(round.elected_total);
    let closing = if round.count_complete {
        if remaining_seats == 0 {
            "All available seats have been filled. Final results are now determined.".to_string()
        } else if eligible.is_empty() {
            format!(
                "No candidates remain eligible for the remaining seats, so no further elections or eliminations are possible under the election rules. \
{} {} vacant. Final results are now determined.",
                seats_phrase(remaining_seats),
                if remaining_seats == 1 { "remains" } else { "remain" }
            )
        } else {
            "No further elections or eliminations are required under the election rules. Final results are now determined."
                .to_string()
        }
    } else if round.numerically_converged && nothing_happened {
        "Vote transfers have stabilized. Further counting steps are still required.".to_string()
    } else {
        "The count is not yet complete. Further iterations are required to determine the final outcome."
            .to_string()
    };
    paragraphs.push(closing);

    let audit_text = format!(
        "Iteration {} summary\n\n{}",
        round.iteration,
        paragraphs.join("\n\n")
    );

    RoundExplanation {
        audit_text,
        summary_text: summary_line(round, &fmt),
    }
}

struct Names<'a> {
    names: &'a HashMap<CandidateId, String>,
}

impl<'a> Names<'a> {
    fn name(&self, cid: CandidateId) -> Option<&'a str> {
        self.names
            .get(&cid)
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
    }

    fn bare(&self, cids: &[CandidateId]) -> String {
        let named: Vec<String> = cids
            .iter()
            .filter_map(|cid| self.name(*cid))
            .map(|n| n.to_string())
            .collect();
        let unnamed = cids.len() - named.len();
        let mut items = named;
        match unnamed {
            0 => {}
            1 => items.push("an unnamed candidate".to_string()),
            n => items.push(format!("{} unnamed candidates", n)),
        }
        format_list(&items)
    }

    fn candidate(&self, cid: CandidateId) -> String {
        match self.name(cid) {
            Some(n) => format!("candidate {}", n),
            None => "an unnamed candidate".to_string(),
        }
    }

    fn candidates(&self, cids: &[CandidateId]) -> String {
        match cids {
            [] => "no candidates".to_string(),
            [cid] => self.candidate(*cid),
            _ => format!("candidates {}", self.bare(cids)),
        }
    }
}

fn format_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [a] => a.clone(),
        [a, b] => format!("{} and {}", a, b),
        [init @ .., last] => format!("{}, and {}", init.join(", "), last),
    }
}

fn format_alternatives(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [a] => a.clone(),
        [a, b] => format!("{} or {}", a, b),
        [init @ .., last] => format!("{}, or {}", init.join(", "), last),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn seats_phrase(n: u32) -> String {
    if n == 1 {
        "1 seat".to_string()
    } else {
        format!("{} seats", n)
    }
}

fn explain_tie_break(tb: &TieBreak, fmt: &Names) -> String {
    let mut sentences: Vec<String> = vec![format!(
        "Candidates {} were tied. The predefined deterministic tie-breaking rules were applied in sequence.",
        fmt.bare(&tb.candidate_ids)
    )];

    let failed: Vec<String> = tb
        .rule_trace
        .iter()
        .filter(|step| step.outcome == RuleOutcome::Tied)
        .map(|step| step.rule.title().to_string())
        .collect();
    if !failed.is_empty() {
        sentences.push(format!(
            "No distinction could be made based on {}.",
            format_alternatives(&failed)
        ));
    }

    match tb.resolving_step().map(|s| s.rule) {
        Some(TieBreakRule::CandidateOrderingIdentifier) => sentences.push(
            "The tie was resolved using the final deterministic rule defined at election setup: a fixed candidate ordering identifier."
                .to_string(),
        ),
        Some(rule) => sentences.push(format!("The tie was resolved using {}.", rule.title())),
        None => {}
    }

    match &tb.kind {
        TieBreakKind::ElectionOrder { ordered } => {
            if let [first, rest @ ..] = ordered.as_slice() {
                sentences.push(format!(
                    "Under this rule, {} was ordered ahead of {}.",
                    fmt.candidate(*first),
                    fmt.candidates(rest)
                ));
            }
            sentences.push(
                "This ordering was used only to determine processing order and does not imply a difference in vote totals."
                    .to_string(),
            );
        }
        TieBreakKind::Elimination { selected } => {
            sentences.push(format!(
                "Under this rule, {} was selected for elimination.",
                fmt.candidate(*selected)
            ));
        }
    }
    sentences.join(" ")
}

// Groups forced exclusions by exclusion group, in order of appearance.
fn group_exclusions(events: &[ForcedExclusion]) -> Vec<(String, Vec<ForcedExclusion>)> {
    let mut res: Vec<(String, Vec<ForcedExclusion>)> = Vec::new();
    for e in events.iter() {
        let label = if e.group_name.trim().is_empty() {
            e.group_public_id.trim().to_string()
        } else {
            e.group_name.trim().to_string()
        };
        match res.iter_mut().find(|(l, _)| *l == label) {
            Some((_, group)) => group.push(e.clone()),
            None => res.push((label, vec![e.clone()])),
        }
    }
    res
}

fn explain_exclusions(
    group_label: &str,
    events: &[ForcedExclusion],
    round: &RoundRecord,
    fmt: &Names,
) -> String {
    let mut triggers: Vec<CandidateId> = events.iter().map(|e| e.triggered_by).collect();
    triggers.dedup();
    let excluded: Vec<CandidateId> = events.iter().map(|e| e.candidate_id).collect();
    let (reached, not_reached): (Vec<CandidateId>, Vec<CandidateId>) = excluded
        .iter()
        .cloned()
        .partition(|cid| round.quota_reached.contains(cid));

    let mut sentences: Vec<String> = vec![format!(
        "Because the election of {} satisfied an exclusion group constraint, no additional candidates from the group \"{}\" could be elected.",
        fmt.candidates(&triggers),
        group_label
    )];
    if !reached.is_empty() {
        sentences.push(format!(
            "As a result, {} could not be elected despite reaching the quota and {} excluded from further consideration under the election rules.",
            fmt.candidates(&reached),
            if reached.len() > 1 { "were" } else { "was" }
        ));
    }
    if !not_reached.is_empty() {
        let verb = if not_reached.len() > 1 { "were" } else { "was" };
        let who = fmt.candidates(&not_reached);
        sentences.push(if reached.is_empty() {
            format!(
                "As a result, {} {} excluded from further consideration under the election rules.",
                who, verb
            )
        } else {
            format!(
                "{}, which had not reached the quota, {} also excluded.",
                capitalize(&who),
                verb
            )
        });
    }
    sentences.push("This exclusion was rule-based and not the result of a vote comparison.".to_string());
    sentences.push(format!(
        "Votes for {} will be redistributed to remaining candidates according to voter preferences and current retention factors.",
        fmt.bare(&excluded)
    ));
    sentences.join(" ")
}

fn summary_line(round: &RoundRecord, fmt: &Names) -> String {
    let mut bits: Vec<String> = Vec::new();
    if !round.tie_breaks.is_empty() {
        bits.push("tie resolved deterministically".to_string());
    }
    if !round.elected_by_quota.is_empty() {
        bits.push(format!("elected {}", fmt.bare(&round.elected_by_quota)));
    }
    if !round.elected_to_fill_remaining_seats.is_empty() {
        bits.push(format!(
            "elected {}",
            fmt.bare(&round.elected_to_fill_remaining_seats)
        ));
        bits.push("filled remaining seats by rule".to_string());
    }
    if !round.forced_exclusions.is_empty() {
        let excluded: Vec<CandidateId> = round
            .forced_exclusions
            .iter()
            .map(|e| e.candidate_id)
            .collect();
        bits.push(format!("excluded {} by exclusion group", fmt.bare(&excluded)));
    }
    if let Some(cid) = round.eliminated {
        bits.push(format!("eliminated {}", fmt.bare(&[cid])));
    }
    let status = if round.count_complete {
        "count complete"
    } else if round.numerically_converged && round.elected.is_empty() && round.eliminated.is_none() {
        "vote transfers stabilized"
    } else {
        "further iterations required"
    };
    bits.push(status.to_string());
    format!("Iteration {}: {}.", round.iteration, bits.join("; "))
}
