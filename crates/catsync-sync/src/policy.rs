//! Source-priority merge rules. Pure functions; no I/O.

use catsync_core::{MergeOptions, Provenance};
use serde::Serialize;

use crate::priority::PriorityTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    /// The record is pinned to another provider.
    Locked,
    /// The incumbent provider has a strictly better priority.
    LowerPriority,
    /// Equal priority; the current owner keeps the record.
    EqualPriorityIncumbent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Insert,
    Replace,
    Keep(KeepReason),
}

impl Decision {
    pub fn writes(&self) -> bool {
        !matches!(self, Decision::Keep(_))
    }
}

/// Decides what `candidate` may do with the record currently described by `existing`.
///
/// Rules, first match wins: absent record inserts; manual override replaces; a lock held
/// by anyone else keeps; the current owner always replaces; an ownerless record is
/// claimable; otherwise the strictly lower priority value wins and ties keep the owner.
pub fn decide(
    existing: Option<&Provenance>,
    candidate: &str,
    options: &MergeOptions,
    priorities: &PriorityTable,
) -> Decision {
    let Some(existing) = existing else {
        return Decision::Insert;
    };
    if options.manual_override {
        return Decision::Replace;
    }
    let owner = existing.provider.as_deref();
    if existing.source_locked && owner != Some(candidate) {
        return Decision::Keep(KeepReason::Locked);
    }
    let Some(owner) = owner else {
        return Decision::Replace;
    };
    if owner == candidate {
        return Decision::Replace;
    }

    let incoming = priorities.priority(candidate);
    let incumbent = priorities.priority(owner);
    if incoming < incumbent {
        Decision::Replace
    } else if incoming == incumbent {
        Decision::Keep(KeepReason::EqualPriorityIncumbent)
    } else {
        Decision::Keep(KeepReason::LowerPriority)
    }
}

pub fn should_replace(
    existing: &Provenance,
    candidate: &str,
    options: &MergeOptions,
    priorities: &PriorityTable,
) -> bool {
    decide(Some(existing), candidate, options, priorities).writes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PriorityTable {
        PriorityTable::from_pairs([("P1", 1), ("P2", 2), ("P3", 3), ("Q3", 3)])
    }

    const PLAIN: MergeOptions = MergeOptions {
        manual_override: false,
        source_locked: false,
        force: false,
    };

    const OVERRIDE: MergeOptions = MergeOptions {
        manual_override: true,
        source_locked: false,
        force: false,
    };

    #[test]
    fn absent_record_is_inserted() {
        assert_eq!(decide(None, "P3", &PLAIN, &table()), Decision::Insert);
    }

    #[test]
    fn better_priority_takes_over_and_worse_is_refused() {
        let owned_by_p3 = Provenance::owned_by("P3");
        assert!(should_replace(&owned_by_p3, "P1", &PLAIN, &table()));

        let owned_by_p1 = Provenance::owned_by("P1");
        assert_eq!(
            decide(Some(&owned_by_p1), "P3", &PLAIN, &table()),
            Decision::Keep(KeepReason::LowerPriority)
        );
    }

    #[test]
    fn ties_keep_the_incumbent_in_both_directions() {
        let owned_by_p3 = Provenance::owned_by("P3");
        let owned_by_q3 = Provenance::owned_by("Q3");
        assert_eq!(
            decide(Some(&owned_by_p3), "Q3", &PLAIN, &table()),
            Decision::Keep(KeepReason::EqualPriorityIncumbent)
        );
        assert_eq!(
            decide(Some(&owned_by_q3), "P3", &PLAIN, &table()),
            Decision::Keep(KeepReason::EqualPriorityIncumbent)
        );
    }

    #[test]
    fn owner_always_refreshes_its_own_record() {
        for provider in ["P1", "P3", "unregistered"] {
            let owned = Provenance::owned_by(provider);
            assert!(should_replace(&owned, provider, &PLAIN, &table()));
            assert!(should_replace(&owned.clone().locked(), provider, &PLAIN, &table()));
        }
    }

    #[test]
    fn lock_blocks_even_a_better_provider_unless_overridden() {
        let locked_p3 = Provenance::owned_by("P3").locked();
        assert_eq!(
            decide(Some(&locked_p3), "P1", &PLAIN, &table()),
            Decision::Keep(KeepReason::Locked)
        );
        assert_eq!(
            decide(Some(&locked_p3), "P1", &OVERRIDE, &table()),
            Decision::Replace
        );
    }

    #[test]
    fn ownerless_records_are_claimable_unless_locked() {
        let orphan = Provenance::default();
        assert!(should_replace(&orphan, "P3", &PLAIN, &table()));
        assert!(should_replace(&orphan, "unregistered", &PLAIN, &table()));
        assert!(!should_replace(&orphan.locked(), "P1", &PLAIN, &table()));
    }

    #[test]
    fn unknown_providers_rank_below_every_registered_one() {
        let owned_by_p3 = Provenance::owned_by("P3");
        assert!(!should_replace(&owned_by_p3, "stranger", &PLAIN, &table()));
        let owned_by_stranger = Provenance::owned_by("stranger");
        assert!(should_replace(&owned_by_stranger, "P3", &PLAIN, &table()));
        assert_eq!(
            decide(Some(&owned_by_stranger), "other-stranger", &PLAIN, &table()),
            Decision::Keep(KeepReason::EqualPriorityIncumbent)
        );
    }

    #[test]
    fn replacement_is_monotone_over_the_priority_order() {
        let providers = ["P1", "P2", "P3", "Q3", "stranger"];
        let table = table();
        for owner in providers {
            for candidate in providers {
                let replaced = should_replace(&Provenance::owned_by(owner), candidate, &PLAIN, &table);
                let expected = owner == candidate || table.priority(candidate) < table.priority(owner);
                assert_eq!(replaced, expected, "owner={owner} candidate={candidate}");
            }
        }
    }

    #[test]
    fn applying_the_winner_again_is_stable() {
        let table = table();
        let mut owner = Provenance::owned_by("P2");
        for candidate in ["P3", "P1", "P2", "P1", "Q3"] {
            if should_replace(&owner, candidate, &PLAIN, &table) {
                owner = Provenance::owned_by(candidate);
            }
            assert!(should_replace(&owner, owner.provider.as_deref().unwrap_or_default(), &PLAIN, &table));
        }
        assert_eq!(owner.provider.as_deref(), Some("P1"));
    }
}
