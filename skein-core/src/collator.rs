//! The collation policy layer: which signed increment each protocol stage
//! applies to which ledger, and which faults each post-value produces.
//!
//! The activity driver composes these deltas into store transactions; the
//! collator itself never touches the store, so every rule here is testable
//! as plain arithmetic.

use crate::error::{CollationFault, EngineError, EngineResult};
use crate::ledger::{
    self, AUTHORIZE_DELTA, CLOSE_DELTA, ENTRY_DELTA, LEG2_ENTRY_MAX, MAX_LEG1_ATTEMPTS,
    REENTRY_WEIGHT, STEP1_WEIGHT, STEP2_WEIGHT, STEP3_WEIGHT,
};
use crate::types::LedgerValue;

/// A named protocol stage with a fixed signed increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Leg 1 first processing: consume one entry-countdown tick.
    Entry,
    /// Leg 1 durable work committed; Leg 2 may now enter.
    AuthorizeReentry,
    /// Activities with no Leg 2 close both legs in one commit.
    EarlyCompletion { cyclic: bool },
    /// Cycle activities run Leg 1 only and leave via this stage.
    EarlyExit,
    /// Leg 2 first processing of one message guid (bundled on both ledgers).
    Reentry,
    /// Leg 2 terminal for this message, activity stays open.
    Continuation,
    /// Leg 2 terminal; non-cyclic activities also close Leg 2.
    Completion { cyclic: bool },
    /// Step markers, committed inside the step's own transaction.
    Step1,
    Step2,
    Step3,
}

impl Stage {
    /// Increment applied to the activity ledger.
    pub fn activity_delta(self) -> LedgerValue {
        match self {
            Stage::Entry => ENTRY_DELTA,
            Stage::AuthorizeReentry => AUTHORIZE_DELTA,
            Stage::EarlyCompletion { cyclic: false } => REENTRY_WEIGHT + 1 + 11 * CLOSE_DELTA,
            Stage::EarlyCompletion { cyclic: true } => REENTRY_WEIGHT + 1 + 10 * CLOSE_DELTA,
            Stage::EarlyExit => 11 * CLOSE_DELTA,
            Stage::Reentry => REENTRY_WEIGHT,
            Stage::Continuation => 1,
            Stage::Completion { cyclic: false } => 1 + CLOSE_DELTA,
            Stage::Completion { cyclic: true } => 1,
            Stage::Step1 => STEP1_WEIGHT,
            Stage::Step2 => STEP2_WEIGHT,
            Stage::Step3 => STEP3_WEIGHT,
        }
    }

    /// Increment applied to the GUID ledger, for stages that bundle one.
    pub fn guid_delta(self) -> Option<LedgerValue> {
        match self {
            Stage::Reentry => Some(REENTRY_WEIGHT),
            Stage::Step1 => Some(STEP1_WEIGHT),
            Stage::Step2 => Some(STEP2_WEIGHT),
            Stage::Step3 => Some(STEP3_WEIGHT),
            _ => None,
        }
    }
}

/// Disposition of a Leg 1 entry after verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryDisposition {
    /// Execute (or re-execute) the Leg 1 work.
    Proceed { attempts: u32 },
    /// Leg 1 already completed under an earlier delivery; ack and exit.
    StaleReplay,
}

/// Verify a Leg 1 entry post-value, mapping faults to engine errors.
pub fn verify_entry(activity_id: &str, post: LedgerValue) -> EngineResult<EntryDisposition> {
    match ledger::classify_entry(post) {
        ledger::EntryCheck::Fresh => Ok(EntryDisposition::Proceed { attempts: 1 }),
        ledger::EntryCheck::Retry { attempts } => Ok(EntryDisposition::Proceed { attempts }),
        ledger::EntryCheck::Stale => Ok(EntryDisposition::StaleReplay),
        ledger::EntryCheck::Fault(f) => {
            tracing::warn!(activity_id, fault = ?f, post, "leg 1 entry fault");
            Err(EngineError::Collation(f))
        }
    }
}

/// Enforce the entry-attempt cap before the increment is applied: the
/// in-ledger countdown must have capacity and the stream delivery count must
/// not exceed the wire cap.
pub fn ensure_entry_capacity(
    activity_id: &str,
    current: LedgerValue,
    delivery_count: u32,
) -> EngineResult<()> {
    if delivery_count > MAX_LEG1_ATTEMPTS {
        return Err(EngineError::Maxed {
            activity_id: activity_id.to_string(),
            attempts: delivery_count,
        });
    }
    if ledger::entry_attempts_exhausted(current) {
        return Err(EngineError::Maxed {
            activity_id: activity_id.to_string(),
            attempts: 9,
        });
    }
    Ok(())
}

/// Enforce the Leg 2 entry-counter cap before a re-entry tick is applied.
pub fn ensure_reentry_capacity(activity_id: &str, current: LedgerValue) -> EngineResult<()> {
    if ledger::reentry_exhausted(current) {
        tracing::error!(
            activity_id,
            current,
            cap = LEG2_ENTRY_MAX,
            "leg 2 entry counter exhausted"
        );
        return Err(EngineError::Collation(CollationFault::Invalid));
    }
    Ok(())
}

/// Disposition of a Leg 2 re-entry after verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReentryDisposition {
    /// First delivery: run every step.
    Proceed,
    /// Redelivery: run only the steps whose markers are unset.
    Resume,
}

/// Verify a bundled Leg 2 re-entry (activity and GUID post-values).
pub fn verify_reentry(
    activity_id: &str,
    activity_post: LedgerValue,
    guid_post: LedgerValue,
    cyclic: bool,
) -> EngineResult<ReentryDisposition> {
    match ledger::classify_reentry(activity_post, guid_post, cyclic) {
        ledger::ReentryCheck::Fresh => Ok(ReentryDisposition::Proceed),
        ledger::ReentryCheck::Resume => Ok(ReentryDisposition::Resume),
        ledger::ReentryCheck::Fault(f) => {
            match f {
                CollationFault::Duplicate | CollationFault::Inactive => {
                    tracing::info!(activity_id, fault = ?f, "stale leg 2 replay");
                }
                _ => {
                    tracing::warn!(activity_id, fault = ?f, activity_post, guid_post, "leg 2 re-entry fault");
                }
            }
            Err(EngineError::Collation(f))
        }
    }
}
