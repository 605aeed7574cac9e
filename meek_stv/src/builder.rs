use uuid::Uuid;

pub use crate::config::*;

/// A builder for preparing a count from candidate names.
///
/// Candidates receive sequential ids in the order they are declared.
///
/// ```
/// pub use meek_stv::builder::Builder;
/// pub use meek_stv::TallyRules;
/// # use meek_stv::TallyError;
///
/// let mut builder = Builder::new(&TallyRules::default(), 1)?
///     .candidates(&["Anna".to_string(), "Bob".to_string()])?;
///
/// builder.add_vote_simple(&["Anna".to_string(), "Bob".to_string()])?;
/// builder.add_vote(&["Bob".to_string()], 3)?;
///
/// let result = builder.tally()?;
/// assert_eq!(result.elected.len(), 1);
///
/// # Ok::<(), TallyError>(())
/// ```
pub struct Builder {
    pub(crate) _rules: TallyRules,
    pub(crate) _seats: u32,
    pub(crate) _candidates: Vec<Candidate>,
    pub(crate) _groups: Vec<ExclusionGroup>,
    pub(crate) _ballots: Vec<Ballot>,
}

impl Builder {
    pub fn new(rules: &TallyRules, seats: u32) -> Result<Builder, TallyError> {
        if seats == 0 {
            return Err(TallyError::InvalidSeats);
        }
        Ok(Builder {
            _rules: rules.clone(),
            _seats: seats,
            _candidates: Vec::new(),
            _groups: Vec::new(),
            _ballots: Vec::new(),
        })
    }

    /// Declares the candidates, each with a fresh random tie-break identifier.
    pub fn candidates(self, cands: &[String]) -> Result<Builder, TallyError> {
        let with_ids: Vec<(String, Uuid)> = cands
            .iter()
            .map(|name| (name.clone(), Uuid::new_v4()))
            .collect();
        self.candidates_with_tiebreak(&with_ids)
    }

    /// Declares the candidates with explicit tie-break identifiers.
    pub fn candidates_with_tiebreak(self, cands: &[(String, Uuid)]) -> Result<Builder, TallyError> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for (idx, (name, tiebreak_uuid)) in cands.iter().enumerate() {
            if candidates.iter().any(|c| c.name == *name) {
                return Err(TallyError::DuplicateCandidate(idx as CandidateId + 1));
            }
            candidates.push(Candidate {
                id: idx as CandidateId + 1,
                name: name.clone(),
                tiebreak_uuid: *tiebreak_uuid,
            });
        }
        Ok(Builder {
            _candidates: candidates,
            _ballots: Vec::new(),
            ..self
        })
    }

    /// At most `max_elected` of the named candidates may win.
    pub fn exclusion_group(
        mut self,
        name: &str,
        max_elected: u32,
        members: &[String],
    ) -> Result<Builder, TallyError> {
        let candidate_ids = members
            .iter()
            .map(|m| self.lookup(m))
            .collect::<Result<Vec<CandidateId>, TallyError>>()?;
        self._groups.push(ExclusionGroup {
            public_id: format!("group-{}", self._groups.len() + 1),
            name: name.to_string(),
            max_elected,
            candidate_ids,
        });
        Ok(self)
    }

    fn lookup(&self, name: &str) -> Result<CandidateId, TallyError> {
        self._candidates
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
            .ok_or_else(|| TallyError::UnknownCandidateName(name.to_string()))
    }

    /// Adds a ballot of weight 1.
    pub fn add_vote_simple(&mut self, ranking: &[String]) -> Result<(), TallyError> {
        self.add_vote(ranking, 1)
    }

    /// Adds a ballot with the given weight.
    ///
    /// ranking: the names of the candidates, most preferred first. Names that
    /// do not match a declared candidate are rejected.
    pub fn add_vote(&mut self, ranking: &[String], weight: u64) -> Result<(), TallyError> {
        let ranking = ranking
            .iter()
            .map(|name| self.lookup(name))
            .collect::<Result<Vec<CandidateId>, TallyError>>()?;
        self.add_ballot(&Ballot { ranking, weight })
    }

    pub fn add_ballot(&mut self, ballot: &Ballot) -> Result<(), TallyError> {
        self._ballots.push(ballot.clone());
        Ok(())
    }

    pub fn tally(&self) -> Result<TallyResult, TallyError> {
        crate::run_meek_tally(
            &self._ballots,
            &self._candidates,
            self._seats,
            &self._groups,
            &self._rules,
        )
    }

    /// The name of a candidate id assigned by this builder.
    pub fn candidate_name(&self, cid: CandidateId) -> Option<&str> {
        self._candidates
            .iter()
            .find(|c| c.id == cid)
            .map(|c| c.name.as_str())
    }
}
