//! Reconciliation primitives.
//!
//! This library provides the pure half of device reconciliation: given the
//! attachments a guest has now and the attachments it should have, compute
//! the smallest ordered set of mutations that converges one onto the other.
//! Executing the plan against a platform is the caller's job.
//!
//! - **Previous set**: slot -> attachment, as read from the platform.
//! - **Desired set**: slot -> attachment, as declared by the operator.
//! - **Plan**: deletes, then writes, then moves, then resizes.
//!
//! # Invariants
//!
//! - Planning is deterministic: slots are visited in `SlotKey` order
//! - A protected slot (the container root) is never deleted
//! - A slot that is replaced is never also moved or resized

use std::collections::BTreeMap;
use std::time::Duration;

use pvx_id::SlotKey;
use thiserror::Error;

/// Planning errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A protected slot would have to be deleted to satisfy the desired set.
    #[error("slot {slot} cannot be replaced: {reason}")]
    ProtectedSlot { slot: SlotKey, reason: String },
}

// ============================================================================
// Attachments
// ============================================================================

/// A device that can sit in an attachment slot.
///
/// Implemented by the provisioner's attachment model; the planner only needs
/// to know how to compare two records and how to merge one into another.
pub trait Attachable: Clone {
    /// Platform-assigned volume reference, once known.
    fn volume(&self) -> Option<&str>;

    /// Storage backend the volume lives on.
    fn storage(&self) -> Option<&str>;

    /// Size in KiB, for storage attachments.
    fn size_kib(&self) -> Option<u64>;

    /// True when the attachment is backed by a storage volume.
    fn is_storage(&self) -> bool;

    /// True when `other` is the same kind of device (disk vs. network ...).
    fn same_kind(&self, other: &Self) -> bool;

    /// Fills fields left unset in `self` from the previous record at the
    /// same slot.
    fn inherit(&mut self, prev: &Self);

    /// True when the record must be rewritten even though its volume is
    /// kept. Storage and size changes are not rewrites; they are planned as
    /// explicit moves and resizes.
    fn needs_rewrite(&self, prev: &Self) -> bool;
}

/// An explicit move of a volume to another storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMove {
    pub slot: SlotKey,
    pub storage: String,
}

/// An explicit resize of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeResize {
    pub slot: SlotKey,
    pub size_kib: u64,
}

/// Ordered mutations converging the previous set onto the desired set.
#[derive(Debug, Clone)]
pub struct AttachmentPlan<A> {
    /// Slots to remove, in one bulk call.
    pub deletes: Vec<SlotKey>,

    /// Slots to (re)write, in one bulk call. Records are already merged
    /// with the previous record at the same slot.
    pub writes: BTreeMap<SlotKey, A>,

    /// Volumes to move, after writes.
    pub moves: Vec<VolumeMove>,

    /// Volumes to resize, after moves.
    pub resizes: Vec<VolumeResize>,

    /// The complete desired set after merging with the previous records.
    pub desired: BTreeMap<SlotKey, A>,
}

impl<A> AttachmentPlan<A> {
    /// Returns true if nothing needs to change on the platform.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
            && self.writes.is_empty()
            && self.moves.is_empty()
            && self.resizes.is_empty()
    }

    /// Returns true if `slot` is deleted and written again by this plan.
    pub fn replaces(&self, slot: &SlotKey) -> bool {
        self.deletes.contains(slot) && self.writes.contains_key(slot)
    }

    /// Deletes that are not immediately followed by a write to the same slot.
    ///
    /// A platform that accepts deletes and writes in one request must not see
    /// the same key in both; a write over an occupied slot replaces it.
    pub fn bare_deletes(&self) -> Vec<SlotKey> {
        self.deletes
            .iter()
            .filter(|slot| !self.writes.contains_key(slot))
            .copied()
            .collect()
    }
}

/// Plans the mutations needed to turn `prev` into `desired`.
pub fn plan_attachments<A: Attachable>(
    prev: &BTreeMap<SlotKey, A>,
    desired: &BTreeMap<SlotKey, A>,
) -> Result<AttachmentPlan<A>, PlanError> {
    let mut deletes = Vec::new();

    // 1. Delete pass
    for (slot, old) in prev {
        let replace = match desired.get(slot) {
            None => true,
            Some(new) if !new.same_kind(old) => true,
            Some(new) => matches!(
                (new.volume(), old.volume()),
                (Some(want), have) if Some(want) != have
            ),
        };
        if !replace {
            continue;
        }
        if slot.is_root() {
            if let Some(new) = desired.get(slot) {
                let reason = if new.same_kind(old) {
                    "root volume cannot be replaced; resize or move it"
                } else {
                    "a different kind of device cannot take its place"
                };
                return Err(PlanError::ProtectedSlot {
                    slot: *slot,
                    reason: reason.to_string(),
                });
            }
            continue;
        }
        deletes.push(*slot);
    }

    // 2. Create/replace pass
    let mut merged = BTreeMap::new();
    let mut writes = BTreeMap::new();
    for (slot, new) in desired {
        let mut record = new.clone();
        let deleted = deletes.contains(slot);
        match prev.get(slot) {
            Some(old) if !deleted => {
                record.inherit(old);
                if record.needs_rewrite(old) {
                    writes.insert(*slot, record.clone());
                }
            }
            Some(old) if old.same_kind(&record) => {
                // Replaced by a different volume; keep the old layout.
                record.inherit(old);
                writes.insert(*slot, record.clone());
            }
            _ => {
                writes.insert(*slot, record.clone());
            }
        }
        merged.insert(*slot, record);
    }

    // 3. Move pass and 4. resize pass, for slots that keep their volume
    let mut moves = Vec::new();
    let mut resizes = Vec::new();
    for (slot, old) in prev {
        let Some(new) = merged.get(slot) else {
            continue;
        };
        if deletes.contains(slot) || !new.is_storage() || !old.is_storage() {
            continue;
        }
        if let Some(storage) = new.storage() {
            if Some(storage) != old.storage() {
                moves.push(VolumeMove {
                    slot: *slot,
                    storage: storage.to_string(),
                });
            }
        }
        if let Some(size_kib) = new.size_kib() {
            if Some(size_kib) != old.size_kib() {
                resizes.push(VolumeResize {
                    slot: *slot,
                    size_kib,
                });
            }
        }
    }

    Ok(AttachmentPlan {
        deletes,
        writes,
        moves,
        resizes,
        desired: merged,
    })
}

// ============================================================================
// Retry
// ============================================================================

/// Default number of attempts for an operation that races other writers.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff step; attempt `n` sleeps `n` steps before retrying.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(250);

/// Bounded retry with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    max_attempts: u32,

    /// Backoff unit.
    step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy. At least one attempt is always made.
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            step,
        }
    }

    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns true if another attempt may follow the (1-based) `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt)
    }
}
