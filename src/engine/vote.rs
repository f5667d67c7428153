//! Vote consensus resolution.
//!
//! Voters append their choice under `votes/{uid}`; once every eligible voter
//! has written one, the controller tallies. Binary proposals resolve by
//! strict majority, multi-candidate proposals by plurality with a randomized
//! tiebreak among the maximum-count candidates. The proposal's `resolved`
//! flag is consumed through a compare-and-swap so a late duplicate
//! observation of the full vote set can never re-trigger resolution.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use rand::seq::IndexedRandom;
use uuid::Uuid;

use crate::engine::records::{Proposal, Role, Roster, decode};
use crate::store::{SharedStore, StorePath, StoreResult, TransactionUpdate};

/// Result of tallying the current vote set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TallyOutcome {
    /// Not every eligible voter has cast a valid vote yet (or there are no
    /// eligible voters at all, in which case a tally never triggers).
    Pending,
    /// A single candidate holds the maximum.
    Winner(String),
    /// Several candidates tie for the maximum; enter the tiebreak sub-phase.
    Tie(Vec<String>),
}

/// Voters counted toward the eligible total: connected actors. Disconnected
/// participants drop out of the count rather than wedging the tally.
pub fn eligible_voters(roster: &Roster) -> BTreeSet<Uuid> {
    roster
        .values()
        .filter(|participant| participant.role == Role::Actor && participant.connected)
        .map(|participant| participant.id)
        .collect()
}

/// Tally `votes` against `proposal` for the given eligible voters.
///
/// Votes from ineligible voters and votes naming unknown options are ignored
/// (malformed writes never crash the resolver, they just do not count).
pub fn tally(
    proposal: &Proposal,
    votes: &IndexMap<Uuid, String>,
    eligible: &BTreeSet<Uuid>,
) -> TallyOutcome {
    if eligible.is_empty() {
        return TallyOutcome::Pending;
    }

    let known: BTreeSet<&str> = proposal
        .options
        .iter()
        .map(|option| option.id.as_str())
        .collect();
    let valid: Vec<(&Uuid, &String)> = votes
        .iter()
        .filter(|(voter, choice)| eligible.contains(voter) && known.contains(choice.as_str()))
        .collect();

    if valid.len() < eligible.len() {
        return TallyOutcome::Pending;
    }

    let mut counts: IndexMap<&str, usize> = proposal
        .options
        .iter()
        .map(|option| (option.id.as_str(), 0))
        .collect();
    for (_, choice) in &valid {
        if let Some(count) = counts.get_mut(choice.as_str()) {
            *count += 1;
        }
    }

    if proposal.binary {
        // Strictly more than half of the eligible voters for the first
        // option; anything else resolves to the second.
        let affirmative = counts.first().map(|(_, count)| *count).unwrap_or(0);
        let winner = if affirmative * 2 > eligible.len() {
            proposal.options.first()
        } else {
            proposal.options.get(1)
        };
        return match winner {
            Some(option) => TallyOutcome::Winner(option.id.clone()),
            None => TallyOutcome::Pending,
        };
    }

    let max = counts.values().copied().max().unwrap_or(0);
    let mut leaders: Vec<String> = counts
        .iter()
        .filter(|(_, count)| **count == max)
        .map(|(id, _)| (*id).to_string())
        .collect();
    leaders.sort();

    match leaders.len() {
        0 => TallyOutcome::Pending,
        1 => TallyOutcome::Winner(leaders.remove(0)),
        _ => TallyOutcome::Tie(leaders),
    }
}

/// Pick the tiebreak winner uniformly at random among the tied candidates.
pub fn pick_tiebreak(tied: &[String]) -> Option<String> {
    let mut rng = rand::rng();
    tied.choose(&mut rng).cloned()
}

/// Consume the proposal's tally flag. Returns true exactly once per
/// proposal: the caller that flips `resolved` owns the resolution, every
/// later caller observes a no-op.
pub async fn consume_tally(
    store: &Arc<dyn SharedStore>,
    proposal_path: &StorePath,
) -> StoreResult<bool> {
    let outcome = store
        .transact(
            proposal_path,
            Box::new(|current| {
                let Some(proposal) = decode::<Proposal>(current) else {
                    return TransactionUpdate::Keep;
                };
                if proposal.resolved {
                    return TransactionUpdate::Keep;
                }
                let consumed = Proposal {
                    resolved: true,
                    ..proposal
                };
                match serde_json::to_value(consumed) {
                    Ok(value) => TransactionUpdate::Set(value),
                    Err(_) => TransactionUpdate::Keep,
                }
            }),
        )
        .await?;

    Ok(outcome.committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::records::{Participant, ProposalOption};
    use crate::store::MemoryStore;

    fn proposal(option_ids: &[&str], binary: bool) -> Proposal {
        Proposal {
            id: Uuid::new_v4(),
            options: option_ids
                .iter()
                .map(|id| ProposalOption {
                    id: (*id).to_string(),
                    label: id.to_uppercase(),
                })
                .collect(),
            binary,
            resolved: false,
        }
    }

    fn actor(connected: bool) -> Participant {
        let id = Uuid::new_v4();
        Participant {
            id,
            display_name: format!("actor-{id}"),
            role: Role::Actor,
            score: 0,
            penalized_until: None,
            connected,
        }
    }

    fn roster_of(participants: Vec<Participant>) -> Roster {
        participants.into_iter().map(|p| (p.id, p)).collect()
    }

    #[test]
    fn unique_maximum_always_wins() {
        let proposal = proposal(&["a", "b", "c"], false);
        let voters: Vec<Participant> = (0..3).map(|_| actor(true)).collect();
        let eligible: BTreeSet<Uuid> = voters.iter().map(|v| v.id).collect();
        let votes: IndexMap<Uuid, String> = voters
            .iter()
            .zip(["b", "b", "a"])
            .map(|(voter, choice)| (voter.id, choice.to_string()))
            .collect();

        for _ in 0..10 {
            assert_eq!(
                tally(&proposal, &votes, &eligible),
                TallyOutcome::Winner("b".into())
            );
        }
    }

    #[test]
    fn tie_reports_exactly_the_tied_set() {
        let proposal = proposal(&["a", "b", "c"], false);
        let voters: Vec<Participant> = (0..4).map(|_| actor(true)).collect();
        let eligible: BTreeSet<Uuid> = voters.iter().map(|v| v.id).collect();
        let votes: IndexMap<Uuid, String> = voters
            .iter()
            .zip(["a", "a", "c", "c"])
            .map(|(voter, choice)| (voter.id, choice.to_string()))
            .collect();

        let TallyOutcome::Tie(tied) = tally(&proposal, &votes, &eligible) else {
            panic!("expected a tie");
        };
        assert_eq!(tied, ["a", "c"]);

        // The tiebreak pick always lands inside the tied set.
        for _ in 0..20 {
            let pick = pick_tiebreak(&tied).unwrap();
            assert!(tied.contains(&pick));
        }
    }

    #[test]
    fn binary_needs_a_strict_majority() {
        let proposal = proposal(&["yes", "no"], true);
        let voters: Vec<Participant> = (0..4).map(|_| actor(true)).collect();
        let eligible: BTreeSet<Uuid> = voters.iter().map(|v| v.id).collect();

        // 2 of 4 is not strictly more than half.
        let votes: IndexMap<Uuid, String> = voters
            .iter()
            .zip(["yes", "yes", "no", "no"])
            .map(|(voter, choice)| (voter.id, choice.to_string()))
            .collect();
        assert_eq!(
            tally(&proposal, &votes, &eligible),
            TallyOutcome::Winner("no".into())
        );

        let votes: IndexMap<Uuid, String> = voters
            .iter()
            .zip(["yes", "yes", "yes", "no"])
            .map(|(voter, choice)| (voter.id, choice.to_string()))
            .collect();
        assert_eq!(
            tally(&proposal, &votes, &eligible),
            TallyOutcome::Winner("yes".into())
        );
    }

    #[test]
    fn ineligible_and_unknown_votes_are_ignored() {
        let proposal = proposal(&["a", "b"], false);
        let voter = actor(true);
        let eligible = BTreeSet::from([voter.id]);

        let mut votes: IndexMap<Uuid, String> = IndexMap::new();
        votes.insert(Uuid::new_v4(), "a".into()); // not an eligible voter
        votes.insert(voter.id, "definitely-not-an-option".into());
        assert_eq!(tally(&proposal, &votes, &eligible), TallyOutcome::Pending);

        votes.insert(voter.id, "b".into());
        assert_eq!(
            tally(&proposal, &votes, &eligible),
            TallyOutcome::Winner("b".into())
        );
    }

    #[test]
    fn zero_eligible_voters_never_tally() {
        let proposal = proposal(&["a", "b"], false);
        assert_eq!(
            tally(&proposal, &IndexMap::new(), &BTreeSet::new()),
            TallyOutcome::Pending
        );
    }

    #[test]
    fn disconnected_actors_leave_the_eligible_count() {
        let connected = actor(true);
        let gone = actor(false);
        let roster = roster_of(vec![connected.clone(), gone]);
        assert_eq!(eligible_voters(&roster), BTreeSet::from([connected.id]));
    }

    #[tokio::test]
    async fn tally_flag_is_consumed_exactly_once() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let path = StorePath::parse("rooms/ABCD/proposal");
        store
            .put(&path, serde_json::to_value(proposal(&["a", "b"], false)).unwrap())
            .await
            .unwrap();

        assert!(consume_tally(&store, &path).await.unwrap());
        assert!(!consume_tally(&store, &path).await.unwrap());
        assert!(!consume_tally(&store, &path).await.unwrap());
    }
}
