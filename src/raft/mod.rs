//! Consensus boundary consumed by the master.
//!
//! The master never implements consensus itself; it talks to the replicated
//! log through the narrow [`RaftPartition`] trait: submit an opaque record,
//! learn whether this replica leads, and register the apply callback that
//! lands committed records in the state machine.
//!
//! [`SoloPartition`] is the single-replica implementation used by embedded
//! deployments and tests: every submitted record commits locally and is
//! applied synchronously before `submit` returns, which is exactly the
//! contract a real consensus engine provides to the caller.

use crate::error::{MasterError, Result};
use crate::types::{NodeId, Term};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Callback that applies one committed record to the local state machine.
///
/// Apply must not fail: a record that cannot be decoded or stored aborts
/// the process, because a replica that skips a committed record can never
/// be trusted again.
pub type ApplyFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// The replicated-log interface the master consumes.
pub trait RaftPartition: Send + Sync {
    /// Propose a record. Returns once the record has committed and the
    /// registered apply callback has run on this replica.
    fn submit(&self, record: &[u8]) -> Result<()>;

    /// Whether this replica currently leads the consensus group.
    fn is_leader(&self) -> bool;

    /// Current leader id and term.
    fn leader_term(&self) -> (NodeId, Term);

    /// Install the apply callback. Must be called exactly once, before the
    /// first `submit`.
    fn register_apply(&self, apply: ApplyFn);
}

/// Single-replica consensus partition.
///
/// Commits are immediate and apply runs inline. Test hooks allow leader
/// demotion and scripted proposal failures to exercise the rollback paths
/// of callers.
pub struct SoloPartition {
    node_id: NodeId,
    term: AtomicU64,
    leader: AtomicBool,
    apply: RwLock<Option<ApplyFn>>,
    scripted: Mutex<VecDeque<bool>>,
}

impl SoloPartition {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            term: AtomicU64::new(1),
            leader: AtomicBool::new(true),
            apply: RwLock::new(None),
            scripted: Mutex::new(VecDeque::new()),
        }
    }

    /// Demote this replica; subsequent submits fail with `NotLeader`.
    pub fn step_down(&self) {
        self.leader.store(false, Ordering::SeqCst);
    }

    /// Promote this replica and advance the term.
    pub fn become_leader(&self) {
        self.term.fetch_add(1, Ordering::SeqCst);
        self.leader.store(true, Ordering::SeqCst);
    }

    /// Script the outcomes of the next submits: `true` commits, `false`
    /// fails with `ProposalFailed`. Once the script is exhausted, submits
    /// succeed again.
    pub fn script_submit_outcomes(&self, outcomes: &[bool]) {
        let mut scripted = self.scripted.lock();
        scripted.extend(outcomes.iter().copied());
    }
}

impl RaftPartition for SoloPartition {
    fn submit(&self, record: &[u8]) -> Result<()> {
        if !self.is_leader() {
            return Err(MasterError::NotLeader {
                leader: Some(self.node_id),
            });
        }
        if let Some(false) = self.scripted.lock().pop_front() {
            return Err(MasterError::ProposalFailed("commit timeout".into()));
        }
        let apply = self.apply.read();
        match apply.as_ref() {
            Some(f) => {
                f(record);
                Ok(())
            }
            None => Err(MasterError::Internal(
                "no apply callback registered".into(),
            )),
        }
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_term(&self) -> (NodeId, Term) {
        (self.node_id, self.term.load(Ordering::SeqCst))
    }

    fn register_apply(&self, apply: ApplyFn) {
        *self.apply.write() = Some(apply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_submit_applies() {
        let partition = SoloPartition::new(1);
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        partition.register_apply(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        partition.submit(b"record").unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_without_apply_fails() {
        let partition = SoloPartition::new(1);
        assert!(partition.submit(b"record").is_err());
    }

    #[test]
    fn test_not_leader() {
        let partition = SoloPartition::new(1);
        partition.register_apply(Box::new(|_| {}));
        partition.step_down();

        let err = partition.submit(b"record").unwrap_err();
        assert!(matches!(err, MasterError::NotLeader { .. }));

        partition.become_leader();
        assert!(partition.submit(b"record").is_ok());
        assert_eq!(partition.leader_term().1, 2);
    }

    #[test]
    fn test_scripted_failure() {
        let partition = SoloPartition::new(1);
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        partition.register_apply(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        partition.script_submit_outcomes(&[true, false]);
        assert!(partition.submit(b"a").is_ok());
        let err = partition.submit(b"b").unwrap_err();
        assert!(matches!(err, MasterError::ProposalFailed(_)));
        // script exhausted, back to success
        assert!(partition.submit(b"c").is_ok());
        assert_eq!(applied.load(Ordering::SeqCst), 2);
    }
}
