//! Pure arithmetic over 15-digit collation ledgers.
//!
//! Every activity invocation owns one ledger; every transition message owns
//! another (the GUID ledger). Both are monotonic under the signed deltas the
//! collator applies: the top three digits are down-counters seeded at 9 and
//! only ever decremented, the remaining digits are up-counters seeded at 0
//! and only ever incremented, so each committed value proves which protocol
//! stages have reached the store.
//!
//! Digit positions are 1-indexed from the most significant digit of the
//! 15-digit space:
//!
//! | pos | weight | activity ledger          | GUID ledger              |
//! |-----|--------|--------------------------|--------------------------|
//! | 1   | 10^14  | Leg 1 entry countdown    | —                        |
//! | 2   | 10^13  | Leg 1 completion         | —                        |
//! | 3   | 10^12  | Leg 2 closure            | —                        |
//! | 4   | 10^11  | —                        | job-closed snapshot bit  |
//! | 5–7 | 10^10..10^8 | step markers        | step markers             |
//! | 8–15| 10^7..10^0 | Leg 2 entry counter  | delivery counter         |

use crate::error::CollationFault;
use crate::types::LedgerValue;

// ─── Seeds and weights ────────────────────────────────────────

/// Value a ledger is primed with when its invocation is spawned.
pub const BASE_SEED: LedgerValue = 999_000_000_000_000;

/// Value observed immediately after a first Leg 1 entry: the entry has been
/// notarized and execution is pending.
pub const ENTRY_SEED: LedgerValue = 899_000_000_000_000;

/// Value a trigger ledger holds after its single-transaction Leg 1: entry,
/// early completion, and one entry tick, committed at once.
pub const TRIGGER_SEED: LedgerValue = 888_000_001_000_001;

/// Largest representable ledger.
pub const MAX_LEDGER: LedgerValue = 999_999_999_999_999;

pub const ENTRY_DELTA: LedgerValue = -100_000_000_000_000;
pub const AUTHORIZE_DELTA: LedgerValue = -10_000_000_000_000;
pub const CLOSE_DELTA: LedgerValue = -1_000_000_000_000;

/// One Leg 2 re-entry (dimensional) tick.
pub const REENTRY_WEIGHT: LedgerValue = 1_000_000;

pub const STEP1_WEIGHT: LedgerValue = 10_000_000_000;
pub const STEP2_WEIGHT: LedgerValue = 1_000_000_000;
pub const STEP3_WEIGHT: LedgerValue = 100_000_000;

/// Weight of the job-closed snapshot bit in a GUID ledger.
pub const SNAPSHOT_WEIGHT: LedgerValue = 100_000_000_000;

/// Hard cap on the Leg 2 entry counter (low eight digits); a carry out of
/// this region would corrupt the step-3 marker.
pub const LEG2_ENTRY_MAX: LedgerValue = 99_999_999;

/// Wire-level cap on Leg 1 delivery attempts, enforced against the stream
/// delivery count before the entry increment is applied.
pub const MAX_LEG1_ATTEMPTS: u32 = 999;

// ─── Digit extraction ─────────────────────────────────────────

const POW10: [LedgerValue; 15] = [
    100_000_000_000_000,
    10_000_000_000_000,
    1_000_000_000_000,
    100_000_000_000,
    10_000_000_000,
    1_000_000_000,
    100_000_000,
    10_000_000,
    1_000_000,
    100_000,
    10_000,
    1_000,
    100,
    10,
    1,
];

/// Digit at `pos` (1-indexed from most significant). Negative inputs yield
/// negative digits, which the fault predicates rely on.
pub fn digit_at(n: LedgerValue, pos: u32) -> i64 {
    debug_assert!((1..=15).contains(&pos));
    (n / POW10[(pos - 1) as usize]) % 10
}

/// The Leg 2 entry counter: the low eight digits, combining re-entry ticks
/// (weight 10^6) with continuation/completion ticks (weight 1).
pub fn leg2_entry_count(n: LedgerValue) -> LedgerValue {
    n.rem_euclid(100_000_000)
}

/// Zero-based index of the current Leg 2 re-entry, used to thread cyclic
/// re-entries into fresh dimensional subspaces. -1 before the first entry.
pub fn dimensional_index(n: LedgerValue) -> i64 {
    (n / REENTRY_WEIGHT) % 100 - 1
}

// ─── Predicates ───────────────────────────────────────────────

/// Leg to check priming for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leg {
    One,
    Two,
}

/// Whether the ledger proves the prerequisite stage ran. For Leg 1 the
/// post-entry value `ENTRY_DELTA` is the signature of a never-primed ledger
/// (the fetch-and-add created it at zero). For Leg 2 both top digits must
/// have been consumed: entry notarized and re-entry authorized.
pub fn is_primed(n: LedgerValue, leg: Leg) -> bool {
    match leg {
        Leg::One => n != ENTRY_DELTA,
        Leg::Two => digit_at(n, 1) < 9 && digit_at(n, 2) < 9,
    }
}

/// The nines-digit at `pos` has been consumed more than once.
pub fn is_duplicate(n: LedgerValue, pos: u32) -> bool {
    digit_at(n, pos) < 8
}

/// Leg 2 has already closed for this invocation.
pub fn is_inactive(n: LedgerValue) -> bool {
    digit_at(n, 3) < 9
}

/// A committed ledger must stay within 15 digits and non-negative.
pub fn in_bounds(n: LedgerValue) -> bool {
    (0..=MAX_LEDGER).contains(&n)
}

// ─── Step markers ─────────────────────────────────────────────

pub fn step1_done(guid: LedgerValue) -> bool {
    digit_at(guid, 5) >= 1
}

pub fn step2_done(guid: LedgerValue) -> bool {
    digit_at(guid, 6) >= 1
}

pub fn step3_done(guid: LedgerValue) -> bool {
    digit_at(guid, 7) >= 1
}

/// The job-closed snapshot bit: set if and only if this message's semaphore
/// delta crossed the completion threshold.
pub fn snapshot_set(guid: LedgerValue) -> bool {
    digit_at(guid, 4) >= 1
}

// ─── Entry classification ─────────────────────────────────────

/// Outcome of verifying a Leg 1 entry post-value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCheck {
    /// First entry; the invocation now awaits its durable work.
    Fresh,
    /// A prior entry never reached Leg 1 completion; retry the work.
    Retry { attempts: u32 },
    /// Leg 1 completed under an earlier delivery; ack and exit.
    Stale,
    Fault(CollationFault),
}

/// Classify the value returned by the entry increment.
pub fn classify_entry(post: LedgerValue) -> EntryCheck {
    if !is_primed(post, Leg::One) {
        return EntryCheck::Fault(CollationFault::Missing);
    }
    let d1 = digit_at(post, 1);
    if d1 < 0 || post > MAX_LEDGER {
        // The countdown underflowed out of the 15-digit space.
        return EntryCheck::Fault(CollationFault::Invalid);
    }
    if digit_at(post, 2) < 9 {
        return EntryCheck::Stale;
    }
    match d1 {
        9 => EntryCheck::Fault(CollationFault::Invalid),
        8 => EntryCheck::Fresh,
        d => EntryCheck::Retry {
            attempts: (9 - d) as u32,
        },
    }
}

/// True when no further entry attempt may be applied: the countdown digit is
/// exhausted and one more subtraction would leave the digit space.
pub fn entry_attempts_exhausted(current: LedgerValue) -> bool {
    in_bounds(current) && digit_at(current, 1) == 0
}

/// True when one more re-entry tick would carry out of the Leg 2 entry
/// counter region into the step-3 marker.
pub fn reentry_exhausted(current: LedgerValue) -> bool {
    leg2_entry_count(current) + REENTRY_WEIGHT > LEG2_ENTRY_MAX
}

// ─── Re-entry classification ──────────────────────────────────

/// Outcome of verifying a bundled Leg 2 re-entry (activity + GUID post
/// values).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReentryCheck {
    /// First delivery of this message guid.
    Fresh,
    /// Redelivery with unfinished steps; execute only the incomplete tail.
    Resume,
    Fault(CollationFault),
}

/// Classify a Leg 2 re-entry. `cyclic` invocations keep Leg 2 open, so the
/// inactive check is suspended for them.
pub fn classify_reentry(
    activity_post: LedgerValue,
    guid_post: LedgerValue,
    cyclic: bool,
) -> ReentryCheck {
    if !is_primed(activity_post, Leg::Two) {
        return ReentryCheck::Fault(CollationFault::Forbidden);
    }
    if is_inactive(activity_post) && !cyclic {
        return ReentryCheck::Fault(CollationFault::Inactive);
    }
    // A nonzero low digit means this guid ledger has absorbed continuation
    // ticks, which only activity ledgers receive.
    if digit_at(guid_post, 15) != 0 {
        return ReentryCheck::Fault(CollationFault::Invalid);
    }
    if guid_post < 2 * REENTRY_WEIGHT {
        return ReentryCheck::Fresh;
    }
    if step1_done(guid_post) && step2_done(guid_post) {
        // Step 3 only ever runs for the snapshot holder. With every owed
        // step committed, a cyclic activity has nothing left; a non-cyclic
        // one still owes its close tick (a fully closed ledger was already
        // screened by the inactive check above).
        if (!snapshot_set(guid_post) || step3_done(guid_post)) && cyclic {
            return ReentryCheck::Fault(CollationFault::Duplicate);
        }
    }
    ReentryCheck::Resume
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_positions() {
        assert_eq!(digit_at(BASE_SEED, 1), 9);
        assert_eq!(digit_at(BASE_SEED, 2), 9);
        assert_eq!(digit_at(BASE_SEED, 3), 9);
        assert_eq!(digit_at(BASE_SEED, 4), 0);
        assert_eq!(digit_at(TRIGGER_SEED, 1), 8);
        assert_eq!(digit_at(TRIGGER_SEED, 2), 8);
        assert_eq!(digit_at(TRIGGER_SEED, 3), 8);
        assert_eq!(digit_at(TRIGGER_SEED, 9), 1);
        assert_eq!(digit_at(TRIGGER_SEED, 15), 1);
    }

    #[test]
    fn seeds_are_consistent_with_deltas() {
        // First entry against a primed ledger lands on the entry seed.
        assert_eq!(BASE_SEED + ENTRY_DELTA, ENTRY_SEED);
        // A trigger's one-shot leg: entry + early completion + entry tick.
        let early_completion = REENTRY_WEIGHT + 1 + 11 * CLOSE_DELTA;
        assert_eq!(BASE_SEED + ENTRY_DELTA + early_completion, TRIGGER_SEED);
    }

    #[test]
    fn leg2_counts() {
        let v = BASE_SEED + ENTRY_DELTA + AUTHORIZE_DELTA + REENTRY_WEIGHT + 1;
        assert_eq!(leg2_entry_count(v), 1_000_001);
        assert_eq!(dimensional_index(v), 0);
        assert_eq!(dimensional_index(BASE_SEED), -1);
        let v2 = v + REENTRY_WEIGHT + 1;
        assert_eq!(dimensional_index(v2), 1);
    }

    #[test]
    fn priming_predicates() {
        // Entry against a never-primed (implicitly zero) ledger.
        assert!(!is_primed(ENTRY_DELTA, Leg::One));
        assert!(is_primed(ENTRY_SEED, Leg::One));
        assert!(!is_primed(ENTRY_SEED, Leg::Two));
        let authorized = ENTRY_SEED + AUTHORIZE_DELTA;
        assert!(is_primed(authorized, Leg::Two));
    }

    #[test]
    fn inactivity_and_duplicates() {
        let closed = ENTRY_SEED + AUTHORIZE_DELTA + REENTRY_WEIGHT + 1 + CLOSE_DELTA;
        assert!(is_inactive(closed));
        assert!(!is_inactive(ENTRY_SEED));
        let twice_entered = ENTRY_SEED + ENTRY_DELTA;
        assert!(is_duplicate(twice_entered, 1));
        assert!(!is_duplicate(ENTRY_SEED, 1));
    }

    #[test]
    fn entry_classification() {
        assert_eq!(classify_entry(ENTRY_SEED), EntryCheck::Fresh);
        assert_eq!(classify_entry(ENTRY_DELTA), EntryCheck::Fault(CollationFault::Missing));
        // Second delivery while Leg 1 work is uncommitted: retry.
        assert_eq!(
            classify_entry(ENTRY_SEED + ENTRY_DELTA),
            EntryCheck::Retry { attempts: 2 }
        );
        // Leg 1 completed: stale replay.
        assert_eq!(
            classify_entry(ENTRY_SEED + AUTHORIZE_DELTA + ENTRY_DELTA),
            EntryCheck::Stale
        );
    }

    #[test]
    fn entry_exhaustion() {
        // Eight retries consumed the countdown digit.
        let mut v = BASE_SEED;
        for _ in 0..9 {
            v += ENTRY_DELTA;
        }
        assert_eq!(digit_at(v, 1), 0);
        assert!(entry_attempts_exhausted(v));
        assert!(!entry_attempts_exhausted(ENTRY_SEED));
    }

    #[test]
    fn reentry_classification() {
        let authorized = ENTRY_SEED + AUTHORIZE_DELTA;
        let act_post = authorized + REENTRY_WEIGHT;
        // Fresh guid: exactly one re-entry tick.
        assert_eq!(
            classify_reentry(act_post, REENTRY_WEIGHT, false),
            ReentryCheck::Fresh
        );
        // Redelivery with step 1 committed only: resume.
        let guid_resume = 2 * REENTRY_WEIGHT + STEP1_WEIGHT;
        assert_eq!(
            classify_reentry(act_post, guid_resume, false),
            ReentryCheck::Resume
        );
        // All steps committed but the close tick is still owed: resume.
        let guid_done = 2 * REENTRY_WEIGHT + STEP1_WEIGHT + STEP2_WEIGHT;
        assert_eq!(
            classify_reentry(act_post, guid_done, false),
            ReentryCheck::Resume
        );
        // A cyclic activity never closes, so the same state is a duplicate.
        assert_eq!(
            classify_reentry(act_post, guid_done, true),
            ReentryCheck::Fault(CollationFault::Duplicate)
        );
        // Snapshot holder with step 3 pending: resume.
        let guid_owes_step3 = guid_done + SNAPSHOT_WEIGHT;
        assert_eq!(
            classify_reentry(act_post, guid_owes_step3, false),
            ReentryCheck::Resume
        );
        // Leg 1 never authorized re-entry.
        assert_eq!(
            classify_reentry(ENTRY_SEED + REENTRY_WEIGHT, REENTRY_WEIGHT, false),
            ReentryCheck::Fault(CollationFault::Forbidden)
        );
        // Closed activity rejects non-cyclic re-entry but admits cyclic.
        let closed = authorized + REENTRY_WEIGHT + 1 + CLOSE_DELTA;
        assert_eq!(
            classify_reentry(closed + REENTRY_WEIGHT, REENTRY_WEIGHT, false),
            ReentryCheck::Fault(CollationFault::Inactive)
        );
        assert_eq!(
            classify_reentry(closed + REENTRY_WEIGHT, REENTRY_WEIGHT, true),
            ReentryCheck::Fresh
        );
    }

    #[test]
    fn reentry_exhaustion_guard() {
        let near_cap = BASE_SEED + 99_000_000;
        assert!(reentry_exhausted(near_cap));
        assert!(!reentry_exhausted(BASE_SEED + 98_000_000));
    }

    #[test]
    fn guid_marker_digits() {
        let g = REENTRY_WEIGHT + STEP1_WEIGHT + STEP2_WEIGHT + STEP3_WEIGHT + SNAPSHOT_WEIGHT;
        assert!(step1_done(g));
        assert!(step2_done(g));
        assert!(step3_done(g));
        assert!(snapshot_set(g));
        assert!(!step1_done(REENTRY_WEIGHT));
        assert!(!snapshot_set(REENTRY_WEIGHT));
    }

    #[test]
    fn committed_values_stay_in_bounds() {
        for v in [BASE_SEED, ENTRY_SEED, TRIGGER_SEED] {
            assert!(in_bounds(v));
            for pos in 1..=15 {
                let d = digit_at(v, pos);
                assert!((0..=9).contains(&d));
            }
        }
        assert!(!in_bounds(-1));
        assert!(!in_bounds(MAX_LEDGER + 1));
    }
}
