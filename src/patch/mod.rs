//! Patch stage: normalize, dry-run, apply, compile-gate, roll back.
//!
//! A proposal is first normalized into a canonical unified diff, then
//! dry-run against in-memory copies of the files it touches. Only a clean
//! dry run is written to disk, and every write is paired with a snapshot
//! so the controller can restore the pre-patch state before the next
//! iteration.

pub mod apply;
pub mod diff;
pub mod edits;
pub mod lock;

pub use apply::{
    AppliedPatch, ApplyResult, PatchCandidate, PatchPlan, PatchStage, ProposedEdit, Snapshot,
};
pub use diff::{clean_patch_text, fingerprint, normalize_patch, UnifiedDiff};
pub use edits::{parse_edits, EditOp, FileEdit};
pub use lock::WorkingCopyLock;
