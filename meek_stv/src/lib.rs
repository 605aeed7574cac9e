pub mod builder;
mod config;
pub mod explain;
pub mod manual;
mod value;

use log::{debug, info};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use uuid::Uuid;

pub use crate::config::*;
pub use crate::explain::{generate_round_explanation, RoundExplanation};
pub use crate::value::{ParseVoteValueError, VoteValue, SCALE};

// **** Private structures ****

type Totals = BTreeMap<CandidateId, VoteValue>;

fn total_of(totals: &Totals, cid: CandidateId) -> VoteValue {
    totals.get(&cid).cloned().unwrap_or_else(VoteValue::zero)
}

// The result of one pass over all the ballots.
#[derive(Debug, Clone)]
struct Distribution {
    // Everything offered to a candidate, before applying its retention factor.
    incoming: Totals,
    // What the candidate kept.
    retained: Totals,
}

// Comparison key of one rule of the tie-break cascade.
#[derive(Eq, PartialEq, Debug, Clone, PartialOrd, Ord)]
enum TieKey {
    Value(VoteValue),
    Identifier(Uuid),
}

impl TieKey {
    fn describe(&self) -> String {
        match self {
            TieKey::Value(v) => v.to_string(),
            TieKey::Identifier(u) => u.hyphenated().to_string(),
        }
    }
}

// Everything that does not change during the count.
struct TallyContext<'a> {
    ballots: &'a [Ballot],
    seats: usize,
    quota: VoteValue,
    epsilon: VoteValue,
    all_ids: Vec<CandidateId>,
    names: HashMap<CandidateId, String>,
    uuids: HashMap<CandidateId, Uuid>,
    groups: Vec<ExclusionGroup>,
    first_preferences: Totals,
}

// Everything that evolves between iterations.
struct TallyState {
    retention: BTreeMap<CandidateId, VoteValue>,
    // Candidates that were neither eliminated nor excluded. Includes the elected ones.
    continuing: BTreeSet<CandidateId>,
    elected: Vec<CandidateId>,
    eliminated: Vec<CandidateId>,
    forced_excluded: Vec<CandidateId>,
    previous_totals: Totals,
    rounds: Vec<RoundRecord>,
}

// The outcome of one iteration, before it is turned into a public record.
struct RoundDraft {
    quota_reached: Vec<CandidateId>,
    elected_by_quota: Vec<CandidateId>,
    elected_to_fill_remaining_seats: Vec<CandidateId>,
    eliminated: Option<CandidateId>,
    forced_exclusions: Vec<ForcedExclusion>,
    tie_breaks: Vec<TieBreak>,
    retained: Totals,
    numerically_converged: bool,
    max_retention_delta: VoteValue,
}

/// Runs a Meek STV count.
///
/// Arguments:
/// * `ballots` the counted ballots (superseded ballots must already be filtered out)
/// * `candidates` all the candidates of the election
/// * `seats` the number of seats to fill
/// * `exclusion_groups` caps on the number of winners among subsets of candidates
/// * `rules` the numerical parameters of the count
///
/// The count is single-threaded and does not perform any I/O. It either returns a
/// complete result or an error, never a partial result.
pub fn run_meek_tally(
    ballots: &[Ballot],
    candidates: &[Candidate],
    seats: u32,
    exclusion_groups: &[ExclusionGroup],
    rules: &TallyRules,
) -> Result<TallyResult, TallyError> {
    info!(
        "run_meek_tally: Processing {:?} ballots, {:?} candidates, {:?} seats, {:?} exclusion groups",
        ballots.len(),
        candidates.len(),
        seats,
        exclusion_groups.len()
    );

    let ctx = TallyContext::new(ballots, candidates, seats, exclusion_groups, rules)?;
    info!("run_meek_tally: quota: {}", ctx.quota);
    let mut state = TallyState::new(&ctx);

    while state.elected.len() < ctx.seats && !state.continuing.is_empty() {
        if run_fixed_point_phase(&ctx, &mut state, rules.max_iterations)? {
            break;
        }
        if eliminate_lowest(&ctx, &mut state) {
            break;
        }
    }

    info!(
        "run_meek_tally: elected: {:?} eliminated: {:?} forced excluded: {:?}",
        state.elected, state.eliminated, state.forced_excluded
    );
    Ok(TallyResult {
        quota: ctx.quota,
        elected: state.elected,
        eliminated: state.eliminated,
        forced_excluded: state.forced_excluded,
        rounds: state.rounds,
    })
}

impl<'a> TallyContext<'a> {
    fn new(
        ballots: &'a [Ballot],
        candidates: &[Candidate],
        seats: u32,
        exclusion_groups: &[ExclusionGroup],
        rules: &TallyRules,
    ) -> Result<TallyContext<'a>, TallyError> {
        if seats == 0 {
            return Err(TallyError::InvalidSeats);
        }

        let mut names: HashMap<CandidateId, String> = HashMap::new();
        let mut uuids: HashMap<CandidateId, Uuid> = HashMap::new();
        let mut seen_uuids: HashSet<Uuid> = HashSet::new();
        for c in candidates.iter() {
            if names.insert(c.id, c.name.clone()).is_some() {
                return Err(TallyError::DuplicateCandidate(c.id));
            }
            if !seen_uuids.insert(c.tiebreak_uuid) {
                return Err(TallyError::DuplicateTiebreakUuid(c.tiebreak_uuid));
            }
            uuids.insert(c.id, c.tiebreak_uuid);
        }
        let mut all_ids: Vec<CandidateId> = names.keys().cloned().collect();
        all_ids.sort();

        let mut groups: Vec<ExclusionGroup> = Vec::new();
        for g in exclusion_groups.iter() {
            if g.max_elected == 0 {
                return Err(TallyError::InvalidGroup(g.display_name().to_string()));
            }
            if let Some(cid) = g.candidate_ids.iter().find(|cid| !names.contains_key(cid)) {
                return Err(TallyError::UnknownGroupCandidate {
                    group: g.display_name().to_string(),
                    candidate_id: *cid,
                });
            }
            // Membership is a set: a repeated id counts once toward the cap.
            let members: BTreeSet<CandidateId> = g.candidate_ids.iter().cloned().collect();
            groups.push(ExclusionGroup {
                candidate_ids: members.into_iter().collect(),
                ..g.clone()
            });
        }

        let total_weight: VoteValue = ballots
            .iter()
            .map(|b| VoteValue::from_weight(b.weight))
            .sum();
        let quota = total_weight
            .div_int(seats as u64 + 1)
            .ok_or(TallyError::InvalidSeats)?;

        let candidate_set: BTreeSet<CandidateId> = all_ids.iter().cloned().collect();
        let first_preferences = first_preferences(ballots, &candidate_set);
        debug!("TallyContext: first preferences: {:?}", first_preferences);

        Ok(TallyContext {
            ballots,
            seats: seats as usize,
            quota,
            epsilon: rules.epsilon.clone(),
            all_ids,
            names,
            uuids,
            groups,
            first_preferences,
        })
    }

    fn tie_key(
        &self,
        rule: TieBreakRule,
        cid: CandidateId,
        state: &TallyState,
        incoming: &Totals,
    ) -> TieKey {
        match rule {
            TieBreakRule::PriorRoundPerformance => {
                TieKey::Value(total_of(&state.previous_totals, cid))
            }
            TieBreakRule::CumulativeSupport => TieKey::Value(total_of(incoming, cid)),
            TieBreakRule::FirstPreferences => TieKey::Value(total_of(&self.first_preferences, cid)),
            TieBreakRule::CandidateOrderingIdentifier => {
                TieKey::Identifier(self.uuids.get(&cid).cloned().unwrap_or_else(Uuid::nil))
            }
        }
    }

    fn cascade_key(&self, cid: CandidateId, state: &TallyState, incoming: &Totals) -> Vec<TieKey> {
        TieBreakRule::CASCADE
            .iter()
            .map(|rule| self.tie_key(*rule, cid, state, incoming))
            .collect()
    }
}

impl TallyState {
    fn new(ctx: &TallyContext) -> TallyState {
        TallyState {
            retention: ctx
                .all_ids
                .iter()
                .map(|cid| (*cid, VoteValue::one()))
                .collect(),
            continuing: ctx.all_ids.iter().cloned().collect(),
            elected: Vec::new(),
            eliminated: Vec::new(),
            forced_excluded: Vec::new(),
            previous_totals: ctx
                .all_ids
                .iter()
                .map(|cid| (*cid, VoteValue::zero()))
                .collect(),
            rounds: Vec::new(),
        }
    }

    fn is_elected(&self, cid: CandidateId) -> bool {
        self.elected.contains(&cid)
    }

    fn remaining_seats(&self, ctx: &TallyContext) -> usize {
        ctx.seats.saturating_sub(self.elected.len())
    }

    // Continuing candidates that are not elected yet, in display order.
    fn eligible(&self, ctx: &TallyContext) -> Vec<CandidateId> {
        let mut res: Vec<CandidateId> = self
            .continuing
            .iter()
            .filter(|cid| !self.is_elected(**cid))
            .cloned()
            .collect();
        sort_for_display(&mut res, &ctx.names);
        res
    }

    fn count_complete(&self, ctx: &TallyContext) -> bool {
        self.elected.len() >= ctx.seats || self.eligible(ctx).len() <= self.remaining_seats(ctx)
    }

    fn elect(&mut self, ctx: &TallyContext, cid: CandidateId, forced: &mut Vec<ForcedExclusion>) {
        debug!("elect: candidate {:?}", cid);
        self.elected.push(cid);
        forced.extend(self.apply_exclusions(ctx, cid));
    }

    // Once a group reaches its maximum, all its other continuing members are removed.
    fn apply_exclusions(&mut self, ctx: &TallyContext, triggered_by: CandidateId) -> Vec<ForcedExclusion> {
        let mut events: Vec<ForcedExclusion> = Vec::new();
        for group in ctx.groups.iter() {
            if !group.candidate_ids.contains(&triggered_by) {
                continue;
            }
            let elected_in_group = group
                .candidate_ids
                .iter()
                .filter(|cid| self.is_elected(**cid))
                .count();
            if elected_in_group < group.max_elected as usize {
                continue;
            }
            for cid in group.candidate_ids.iter().cloned() {
                if self.is_elected(cid) || !self.continuing.contains(&cid) {
                    continue;
                }
                info!(
                    "apply_exclusions: candidate {:?} excluded, group {:?} is full after electing {:?}",
                    cid,
                    group.display_name(),
                    triggered_by
                );
                self.continuing.remove(&cid);
                self.retention.insert(cid, VoteValue::zero());
                self.forced_excluded.push(cid);
                events.push(ForcedExclusion {
                    candidate_id: cid,
                    group_public_id: group.public_id.clone(),
                    group_name: group.name.clone(),
                    triggered_by,
                });
            }
        }
        events
    }

    // Brings every elected candidate down to the quota. Returns the largest change.
    fn update_retention(&mut self, ctx: &TallyContext, incoming: &Totals) -> VoteValue {
        let zero = VoteValue::zero();
        let one = VoteValue::one();
        let mut max_delta = VoteValue::zero();
        for cid in self.elected.iter() {
            if !self.continuing.contains(cid) {
                continue;
            }
            let received = total_of(incoming, *cid);
            let new_retention = match ctx.quota.checked_div(&received) {
                Some(r) if received.is_positive() => r.clamp_to(&zero, &one),
                _ => continue,
            };
            let old_retention = self.retention.get(cid).cloned().unwrap_or_else(VoteValue::one);
            let delta = new_retention.abs_diff(&old_retention);
            if delta > max_delta {
                max_delta = delta;
            }
            self.retention.insert(*cid, new_retention);
        }
        max_delta
    }

    // Resolves a tie with the cascade. Returns the tied candidates fully ordered
    // (most preferred first) and the trace of the rules that were needed.
    fn break_tie(
        &self,
        ctx: &TallyContext,
        tied: &[CandidateId],
        prefer_highest: bool,
        incoming: &Totals,
    ) -> (Vec<CandidateId>, Vec<RuleStep>) {
        let mut ordered: Vec<CandidateId> = tied.to_vec();
        ordered.sort();
        let mut remaining = ordered.clone();
        let mut trace: Vec<RuleStep> = Vec::new();

        for rule in TieBreakRule::CASCADE {
            let keys: BTreeMap<CandidateId, TieKey> = ordered
                .iter()
                .map(|cid| (*cid, ctx.tie_key(rule, *cid, self, incoming)))
                .collect();
            let candidates = remaining.iter().filter_map(|cid| keys.get(cid));
            let pick: Option<TieKey> = if prefer_highest {
                candidates.max().cloned()
            } else {
                candidates.min().cloned()
            };
            remaining.retain(|cid| keys.get(cid) == pick.as_ref());
            let outcome = if remaining.len() == 1 {
                RuleOutcome::Resolved
            } else {
                RuleOutcome::Tied
            };
            trace.push(RuleStep {
                rule,
                values: keys.iter().map(|(cid, k)| (*cid, k.describe())).collect(),
                remaining: remaining.clone(),
                outcome,
            });
            if outcome == RuleOutcome::Resolved {
                break;
            }
        }

        ordered.sort_by(|a, b| {
            let ka = ctx.cascade_key(*a, self, incoming);
            let kb = ctx.cascade_key(*b, self, incoming);
            if prefer_highest {
                kb.cmp(&ka).then(a.cmp(b))
            } else {
                ka.cmp(&kb).then(a.cmp(b))
            }
        });
        debug!(
            "break_tie: tied: {:?} prefer_highest: {:?} ordered: {:?}",
            tied, prefer_highest, ordered
        );
        (ordered, trace)
    }

    // Orders candidates for election: by `primary` descending, and by the
    // tie-break cascade among equal values.
    fn order_for_election(
        &self,
        ctx: &TallyContext,
        candidates: &[CandidateId],
        primary: &Totals,
        incoming: &Totals,
    ) -> (Vec<CandidateId>, Vec<TieBreak>) {
        let mut sorted: Vec<CandidateId> = candidates.to_vec();
        sorted.sort_by(|a, b| {
            total_of(primary, *b)
                .cmp(&total_of(primary, *a))
                .then(a.cmp(b))
        });

        let mut res: Vec<CandidateId> = Vec::new();
        let mut tie_breaks: Vec<TieBreak> = Vec::new();
        let mut idx = 0;
        while idx < sorted.len() {
            let key = total_of(primary, sorted[idx]);
            let mut group: Vec<CandidateId> = vec![sorted[idx]];
            idx += 1;
            while idx < sorted.len() && total_of(primary, sorted[idx]) == key {
                group.push(sorted[idx]);
                idx += 1;
            }
            if group.len() == 1 {
                res.extend(group);
                continue;
            }
            let (ordered, rule_trace) = self.break_tie(ctx, &group, true, incoming);
            group.sort();
            res.extend(ordered.iter().cloned());
            tie_breaks.push(TieBreak {
                kind: TieBreakKind::ElectionOrder { ordered },
                candidate_ids: group,
                rule_trace,
            });
        }
        (res, tie_breaks)
    }

    // When no more candidates remain eligible than seats remain, they are all
    // elected. This is an electoral fact, independent of the quota.
    fn fill_remaining_seats(
        &mut self,
        ctx: &TallyContext,
        incoming: &Totals,
        tie_breaks: &mut Vec<TieBreak>,
        forced: &mut Vec<ForcedExclusion>,
    ) -> Vec<CandidateId> {
        let remaining_seats = self.remaining_seats(ctx);
        let eligible = self.eligible(ctx);
        if remaining_seats == 0 || eligible.is_empty() || eligible.len() > remaining_seats {
            return Vec::new();
        }
        let previous = self.previous_totals.clone();
        let (ordered, ties) = self.order_for_election(ctx, &eligible, &previous, incoming);
        tie_breaks.extend(ties);

        let mut res: Vec<CandidateId> = Vec::new();
        for cid in ordered {
            // An earlier winner of this batch may have filled a group.
            if !self.continuing.contains(&cid) || self.is_elected(cid) {
                continue;
            }
            self.elect(ctx, cid, forced);
            res.push(cid);
        }
        info!("fill_remaining_seats: elected by rule: {:?}", res);
        res
    }

    fn record_round(&mut self, ctx: &TallyContext, draft: RoundDraft) {
        let mut elected: Vec<CandidateId> = draft.elected_by_quota.clone();
        elected.extend(draft.elected_to_fill_remaining_seats.iter().cloned());

        let mut record = RoundRecord {
            iteration: (self.rounds.len() + 1) as u32,
            quota_reached: draft.quota_reached,
            elected,
            elected_by_quota: draft.elected_by_quota,
            elected_to_fill_remaining_seats: draft.elected_to_fill_remaining_seats,
            eliminated: draft.eliminated,
            forced_exclusions: draft.forced_exclusions,
            tie_breaks: draft.tie_breaks,
            eligible_candidates: self.eligible(ctx),
            retention_factors: ctx
                .all_ids
                .iter()
                .map(|cid| {
                    let r = self.retention.get(cid).cloned().unwrap_or_else(VoteValue::zero);
                    (*cid, r)
                })
                .collect(),
            retained_totals: ctx
                .all_ids
                .iter()
                .map(|cid| (*cid, total_of(&draft.retained, *cid)))
                .collect(),
            numerically_converged: draft.numerically_converged,
            max_retention_delta: draft.max_retention_delta,
            seats: ctx.seats as u32,
            elected_total: self.elected.len() as u32,
            count_complete: self.count_complete(ctx),
            audit_text: String::new(),
            summary_text: String::new(),
        };
        let explanation = generate_round_explanation(&record, &ctx.quota, &ctx.names);
        record.audit_text = explanation.audit_text;
        record.summary_text = explanation.summary_text;

        info!("{}", record.summary_text);
        debug!("record_round: retained totals: {:?}", record.retained_totals);
        self.rounds.push(record);
    }
}

/// Returns true if the count is complete.
fn run_fixed_point_phase(
    ctx: &TallyContext,
    state: &mut TallyState,
    max_iterations: u32,
) -> Result<bool, TallyError> {
    for _ in 0..max_iterations {
        let dist = distribute_votes(ctx.ballots, &state.retention, &state.continuing);
        let threshold = &ctx.quota - &ctx.epsilon;

        let quota_reached: Vec<CandidateId> = state
            .continuing
            .iter()
            .filter(|cid| !state.is_elected(**cid) && total_of(&dist.retained, **cid) >= threshold)
            .cloned()
            .collect();
        let (ordered, mut tie_breaks) =
            state.order_for_election(ctx, &quota_reached, &dist.retained, &dist.incoming);

        let mut forced: Vec<ForcedExclusion> = Vec::new();
        let mut elected_by_quota: Vec<CandidateId> = Vec::new();
        for cid in ordered {
            if state.remaining_seats(ctx) == 0 {
                break;
            }
            if !state.continuing.contains(&cid) || state.is_elected(cid) {
                continue;
            }
            state.elect(ctx, cid, &mut forced);
            elected_by_quota.push(cid);
        }

        let max_retention_delta = state.update_retention(ctx, &dist.incoming);
        let numerically_converged =
            max_retention_delta < ctx.epsilon && elected_by_quota.is_empty() && forced.is_empty();

        let elected_to_fill_remaining_seats =
            state.fill_remaining_seats(ctx, &dist.incoming, &mut tie_breaks, &mut forced);

        state.record_round(
            ctx,
            RoundDraft {
                quota_reached,
                elected_by_quota,
                elected_to_fill_remaining_seats,
                eliminated: None,
                forced_exclusions: forced,
                tie_breaks,
                retained: dist.retained.clone(),
                numerically_converged,
                max_retention_delta,
            },
        );
        state.previous_totals = dist.retained;

        if state.count_complete(ctx) {
            return Ok(true);
        }
        if numerically_converged {
            return Ok(false);
        }
    }
    Err(TallyError::NoConvergence {
        iterations: max_iterations,
    })
}

/// Eliminates the weakest eligible candidate. Returns true if the count is complete.
fn eliminate_lowest(ctx: &TallyContext, state: &mut TallyState) -> bool {
    let dist = distribute_votes(ctx.ballots, &state.retention, &state.continuing);
    let candidates = state.eligible(ctx);
    let lowest = match candidates.iter().map(|cid| total_of(&dist.retained, *cid)).min() {
        Some(v) => v,
        None => return true,
    };
    let mut tied: Vec<CandidateId> = candidates
        .iter()
        .filter(|cid| total_of(&dist.retained, **cid) == lowest)
        .cloned()
        .collect();
    tied.sort();

    let mut tie_breaks: Vec<TieBreak> = Vec::new();
    let selected = if tied.len() > 1 {
        let (ordered, rule_trace) = state.break_tie(ctx, &tied, false, &dist.incoming);
        let selected = ordered[0];
        tie_breaks.push(TieBreak {
            kind: TieBreakKind::Elimination { selected },
            candidate_ids: tied,
            rule_trace,
        });
        selected
    } else {
        tied[0]
    };

    info!(
        "eliminate_lowest: eliminating candidate {:?} with {}",
        selected, lowest
    );
    state.continuing.remove(&selected);
    state.retention.insert(selected, VoteValue::zero());
    state.eliminated.push(selected);

    let mut forced: Vec<ForcedExclusion> = Vec::new();
    let elected_to_fill_remaining_seats =
        state.fill_remaining_seats(ctx, &dist.incoming, &mut tie_breaks, &mut forced);

    state.record_round(
        ctx,
        RoundDraft {
            quota_reached: Vec::new(),
            elected_by_quota: Vec::new(),
            elected_to_fill_remaining_seats,
            eliminated: Some(selected),
            forced_exclusions: forced,
            tie_breaks,
            retained: dist.retained,
            numerically_converged: true,
            max_retention_delta: VoteValue::zero(),
        },
    );
    state.count_complete(ctx)
}

// One pass over all the ballots with the current retention factors.
fn distribute_votes(
    ballots: &[Ballot],
    retention: &BTreeMap<CandidateId, VoteValue>,
    continuing: &BTreeSet<CandidateId>,
) -> Distribution {
    let mut incoming: Totals = continuing
        .iter()
        .map(|cid| (*cid, VoteValue::zero()))
        .collect();
    let mut retained: Totals = incoming.clone();

    for ballot in ballots.iter() {
        let mut remaining = VoteValue::from_weight(ballot.weight);
        let mut seen: HashSet<CandidateId> = HashSet::new();
        for cid in ballot.ranking.iter() {
            if !remaining.is_positive() {
                break;
            }
            // Duplicates are skipped, only the first occurrence counts.
            if !seen.insert(*cid) || !continuing.contains(cid) {
                continue;
            }
            let r = match retention.get(cid) {
                Some(r) if r.is_positive() => r,
                _ => continue,
            };
            if let Some(total) = incoming.get_mut(cid) {
                *total += &remaining;
            }
            let portion = &remaining * r;
            if portion.is_positive() {
                if let Some(total) = retained.get_mut(cid) {
                    *total += &portion;
                }
                remaining -= &portion;
            }
        }
    }
    Distribution { incoming, retained }
}

fn first_preferences(ballots: &[Ballot], candidates: &BTreeSet<CandidateId>) -> Totals {
    let mut first: Totals = candidates
        .iter()
        .map(|cid| (*cid, VoteValue::zero()))
        .collect();
    for ballot in ballots.iter() {
        if ballot.weight == 0 {
            continue;
        }
        if let Some(cid) = ballot.ranking.iter().find(|cid| candidates.contains(cid)) {
            if let Some(total) = first.get_mut(cid) {
                *total += VoteValue::from_weight(ballot.weight);
            }
        }
    }
    first
}

/// Sorts candidates by case-insensitive display name, then by id.
pub fn sort_for_display(cids: &mut [CandidateId], names: &HashMap<CandidateId, String>) {
    cids.sort_by_key(|cid| {
        let name = names.get(cid).map(|n| n.to_lowercase()).unwrap_or_default();
        (name, *cid)
    });
}
