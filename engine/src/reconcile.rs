//! Conflict resolution between the local and remote tiers.
//!
//! This is the core of determinism. Given the local and remote versions of
//! one record, [`resolve`] decides which side wins using last-writer-wins on
//! `updatedAt`. The function is pure: the same inputs always produce the
//! same decision, whichever side is asked.
//!
//! # Rules
//!
//! 1. Neither side has the record: nothing to do
//! 2. Only one side has it: the other side adopts it
//! 3. Different `updatedAt`: the later one wins
//! 4. Same `updatedAt`, same content: already in sync
//! 5. Same `updatedAt`, different content: ambiguous, the remote tier wins

use crate::Record;

/// What reconciliation should do for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Both sides agree (or neither has the record)
    InSync,
    /// Overwrite local with the remote record
    PullRemote(Record),
    /// Overwrite remote with the local record
    PushLocal(Record),
    /// Timestamps tie but content differs; the remote record is applied
    Ambiguous { local: Record, remote: Record },
}

impl Resolution {
    /// The record both tiers hold once the resolution is applied.
    pub fn winner(&self) -> Option<&Record> {
        match self {
            Resolution::InSync => None,
            Resolution::PullRemote(record) | Resolution::PushLocal(record) => Some(record),
            Resolution::Ambiguous { remote, .. } => Some(remote),
        }
    }
}

/// Decide between the local and remote versions of a record.
pub fn resolve(local: Option<&Record>, remote: Option<&Record>) -> Resolution {
    match (local, remote) {
        (None, None) => Resolution::InSync,
        (Some(local), None) => Resolution::PushLocal(local.clone()),
        (None, Some(remote)) => Resolution::PullRemote(remote.clone()),
        (Some(local), Some(remote)) => {
            if local.updated_at > remote.updated_at {
                Resolution::PushLocal(local.clone())
            } else if remote.updated_at > local.updated_at {
                Resolution::PullRemote(remote.clone())
            } else if local.same_content(remote) {
                Resolution::InSync
            } else {
                Resolution::Ambiguous {
                    local: local.clone(),
                    remote: remote.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{LearningProgress, Payload};
    use proptest::prelude::*;

    fn progress(xp: u64, updated_at: u64) -> Record {
        let mut payload = LearningProgress::new("es");
        payload.xp = xp;
        Record::new("p-1", "learner-1", Payload::Progress(payload), updated_at)
    }

    #[test]
    fn later_remote_wins() {
        let local = progress(10, 100);
        let remote = progress(20, 200);
        assert_eq!(
            resolve(Some(&local), Some(&remote)),
            Resolution::PullRemote(remote)
        );
    }

    #[test]
    fn later_local_wins() {
        let local = progress(10, 300);
        let remote = progress(20, 200);
        assert_eq!(
            resolve(Some(&local), Some(&remote)),
            Resolution::PushLocal(local)
        );
    }

    #[test]
    fn missing_side_adopts_other() {
        let record = progress(10, 100);
        assert_eq!(
            resolve(Some(&record), None),
            Resolution::PushLocal(record.clone())
        );
        assert_eq!(
            resolve(None, Some(&record)),
            Resolution::PullRemote(record)
        );
        assert_eq!(resolve(None, None), Resolution::InSync);
    }

    #[test]
    fn equal_timestamps_same_content() {
        let local = progress(10, 100);
        let remote = progress(10, 100);
        assert_eq!(resolve(Some(&local), Some(&remote)), Resolution::InSync);
    }

    #[test]
    fn equal_timestamps_different_content_is_ambiguous() {
        let local = progress(10, 100);
        let remote = progress(99, 100);
        let resolution = resolve(Some(&local), Some(&remote));
        assert!(matches!(resolution, Resolution::Ambiguous { .. }));
        assert_eq!(resolution.winner(), Some(&remote));
    }

    fn arb_accuracy() -> impl Strategy<Value = f64> {
        prop_oneof![
            0.0..=1.0f64,
            any::<f64>().prop_filter("accuracy range", |a| (0.0..=1.0).contains(a)),
        ]
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        (0u64..5, 0u64..5).prop_map(|(xp, updated_at)| progress(xp, updated_at))
    }

    proptest! {
        #[test]
        fn winner_has_latest_timestamp(local in arb_record(), remote in arb_record()) {
            let resolution = resolve(Some(&local), Some(&remote));
            let latest = local.updated_at.max(remote.updated_at);
            if let Some(winner) = resolution.winner() {
                prop_assert_eq!(winner.updated_at, latest);
            }
        }

        #[test]
        fn both_directions_agree_on_winner(a in arb_record(), b in arb_record()) {
            // Swapping sides flips push/pull but never changes the winning record,
            // except for ties where the remote side is preferred.
            let forward = resolve(Some(&a), Some(&b));
            let backward = resolve(Some(&b), Some(&a));
            if a.updated_at != b.updated_at {
                prop_assert_eq!(forward.winner(), backward.winner());
            } else if a.same_content(&b) {
                prop_assert_eq!(forward, Resolution::InSync);
                prop_assert_eq!(backward, Resolution::InSync);
            } else {
                prop_assert_eq!(forward.winner(), Some(&b));
                prop_assert_eq!(backward.winner(), Some(&a));
            }
        }

        #[test]
        fn record_from_the_wire_is_in_sync(xp in any::<u64>(), accuracy in arb_accuracy()) {
            let mut local = progress(xp, 100);
            if let Payload::Progress(payload) = &mut local.payload {
                payload.accuracy = accuracy;
            }
            let json = serde_json::to_string(&local).unwrap();
            let remote: Record = serde_json::from_str(&json).unwrap();

            prop_assert!(local.same_content(&remote));
            prop_assert_eq!(resolve(Some(&local), Some(&remote)), Resolution::InSync);
        }

        #[test]
        fn resolution_is_deterministic(local in arb_record(), remote in arb_record()) {
            prop_assert_eq!(
                resolve(Some(&local), Some(&remote)),
                resolve(Some(&local), Some(&remote))
            );
        }
    }
}
