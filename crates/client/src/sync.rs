//! Reconciliation state machine
//!
//! At most one envelope is outstanding at a time, and remote diffs are
//! applied strictly in committed-version order, so the local document is a
//! deterministic function of the diff sequence applied so far. No three-way
//! merge is ever needed.

use pagesync_protocol::{CommittedDiff, DiffEnvelope, Step};

use crate::rebase::StepRebaser;

/// What the embedder must do after feeding the machine an event, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send the envelope to the relay.
    Send(DiffEnvelope),
    /// Apply the committed diffs to the local document, in the given order.
    Apply(Vec<CommittedDiff>),
    /// State is unrecoverable locally: fetch the full document and a fresh
    /// version, then call [`SyncClient::resynced`].
    Resync,
}

enum Flight {
    Idle,
    Pending {
        envelope: DiffEnvelope,
    },
    PendingWithBuffer {
        envelope: DiffEnvelope,
        buffered: Vec<Step>,
    },
}

/// Client-side sync driver for one document.
pub struct SyncClient<R: StepRebaser> {
    client_id: String,
    known_version: u64,
    next_request_id: u64,
    flight: Flight,
    /// Remote diffs received while a commit was in flight; applied only
    /// once that commit resolves, to preserve one linear apply order.
    held: Vec<CommittedDiff>,
    rebaser: R,
}

impl<R: StepRebaser> SyncClient<R> {
    pub fn new(client_id: impl Into<String>, known_version: u64, rebaser: R) -> Self {
        Self {
            client_id: client_id.into(),
            known_version,
            next_request_id: 0,
            flight: Flight::Idle,
            held: Vec::new(),
            rebaser,
        }
    }

    /// Last committed version this client knows about.
    pub fn known_version(&self) -> u64 {
        self.known_version
    }

    /// True when no envelope is awaiting acknowledgment.
    pub fn is_idle(&self) -> bool {
        matches!(self.flight, Flight::Idle)
    }

    /// Request id of the in-flight envelope, if any.
    pub fn in_flight_request(&self) -> Option<u64> {
        match &self.flight {
            Flight::Idle => None,
            Flight::Pending { envelope } | Flight::PendingWithBuffer { envelope, .. } => {
                Some(envelope.request_id)
            }
        }
    }

    /// The local editor produced steps.
    pub fn local_edit(&mut self, steps: Vec<Step>) -> Vec<Action> {
        if steps.is_empty() {
            return Vec::new();
        }
        match &mut self.flight {
            Flight::Idle => {
                let envelope = self.make_envelope(steps);
                self.flight = Flight::Pending {
                    envelope: envelope.clone(),
                };
                vec![Action::Send(envelope)]
            }
            Flight::Pending { envelope } => {
                let envelope = envelope.clone();
                self.flight = Flight::PendingWithBuffer {
                    envelope,
                    buffered: steps,
                };
                Vec::new()
            }
            Flight::PendingWithBuffer { buffered, .. } => {
                buffered.extend(steps);
                Vec::new()
            }
        }
    }

    /// The relay acknowledged the in-flight envelope.
    pub fn ack(&mut self, request_id: u64, committed_version: u64) -> Vec<Action> {
        if self.in_flight_request() != Some(request_id) {
            tracing::debug!(request_id, "ignoring ack for unknown request");
            return Vec::new();
        }
        self.known_version = committed_version;
        let released = self.release_held();
        let mut actions = Vec::new();
        if !released.is_empty() {
            actions.push(Action::Apply(released.clone()));
        }

        match std::mem::replace(&mut self.flight, Flight::Idle) {
            Flight::PendingWithBuffer { buffered, .. } => {
                // Steps accumulated during the round trip reference the
                // document as it stood before the released diffs; they must
                // cross those diffs before becoming the next envelope.
                let buffered = if released.is_empty() {
                    buffered
                } else {
                    self.rebaser.rebase(buffered, &released)
                };
                let envelope = self.make_envelope(buffered);
                self.flight = Flight::Pending {
                    envelope: envelope.clone(),
                };
                actions.push(Action::Send(envelope));
            }
            Flight::Pending { .. } | Flight::Idle => {}
        }
        actions
    }

    /// The relay reported the in-flight envelope as stale: apply the missed
    /// diffs, transform the pending steps over them, resubmit.
    pub fn rebase(&mut self, request_id: u64, missed: Vec<CommittedDiff>) -> Vec<Action> {
        if self.in_flight_request() != Some(request_id) {
            tracing::debug!(request_id, "ignoring rebase for unknown request");
            return Vec::new();
        }

        let fresh: Vec<CommittedDiff> = missed
            .into_iter()
            .filter(|d| d.version > self.known_version)
            .collect();
        let mut actions = Vec::new();
        if let Some(last) = fresh.last() {
            self.known_version = last.version;
            actions.push(Action::Apply(fresh.clone()));
        }
        // Anything held was committed in the same window and is covered by
        // the missed slice.
        self.held.retain(|d| d.version > self.known_version);

        match std::mem::replace(&mut self.flight, Flight::Idle) {
            Flight::Pending { envelope } => {
                let envelope = self.rebased_envelope(envelope, &fresh);
                self.flight = Flight::Pending {
                    envelope: envelope.clone(),
                };
                actions.push(Action::Send(envelope));
            }
            Flight::PendingWithBuffer { envelope, buffered } => {
                let envelope = self.rebased_envelope(envelope, &fresh);
                // Buffered steps sit on top of the same document; they must
                // cross the missed diffs too.
                let buffered = self.rebaser.rebase(buffered, &fresh);
                self.flight = Flight::PendingWithBuffer {
                    envelope: envelope.clone(),
                    buffered,
                };
                actions.push(Action::Send(envelope));
            }
            Flight::Idle => {}
        }
        actions
    }

    /// A broadcast diff from another client arrived.
    pub fn remote_diff(&mut self, diff: CommittedDiff) -> Vec<Action> {
        if matches!(self.flight, Flight::Idle) {
            if diff.version <= self.known_version {
                return Vec::new();
            }
            self.known_version = diff.version;
            vec![Action::Apply(vec![diff])]
        } else {
            self.held.push(diff);
            Vec::new()
        }
    }

    /// No response arrived within the client's deadline. The envelope is
    /// never resent unmodified; the relay may have committed it before the
    /// timeout, and its idempotency table resolves that race after resync.
    pub fn timeout(&mut self) -> Vec<Action> {
        if matches!(self.flight, Flight::Idle) {
            return Vec::new();
        }
        tracing::warn!(known_version = self.known_version, "commit timed out, resyncing");
        self.flight = Flight::Idle;
        self.held.clear();
        vec![Action::Resync]
    }

    /// The embedder finished a full resynchronization at `version`.
    pub fn resynced(&mut self, version: u64) {
        self.known_version = version;
        self.flight = Flight::Idle;
        self.held.clear();
    }

    fn make_envelope(&mut self, steps: Vec<Step>) -> DiffEnvelope {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        DiffEnvelope {
            request_id,
            client_id: self.client_id.clone(),
            base_version: self.known_version,
            steps,
        }
    }

    fn rebased_envelope(
        &mut self,
        envelope: DiffEnvelope,
        missed: &[CommittedDiff],
    ) -> DiffEnvelope {
        DiffEnvelope {
            request_id: envelope.request_id,
            client_id: envelope.client_id,
            base_version: self.known_version,
            steps: self.rebaser.rebase(envelope.steps, missed),
        }
    }

    fn release_held(&mut self) -> Vec<CommittedDiff> {
        if self.held.is_empty() {
            return Vec::new();
        }
        let mut held = std::mem::take(&mut self.held);
        held.sort_by_key(|d| d.version);
        // A subscribe catch-up reply and a broadcast can both deliver the
        // same commit while a flight is pending.
        held.dedup_by_key(|d| d.version);
        held.retain(|d| d.version > self.known_version);
        if let Some(last) = held.last() {
            self.known_version = last.version;
        }
        held
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::rebase::IdentityRebaser;
    use pagesync_protocol::Step;
    use serde_json::json;

    fn step(insert: &str) -> Step {
        Step::new(json!({ "from": 0, "to": 0, "insert": insert }))
    }

    fn diff(version: u64, client: &str) -> CommittedDiff {
        CommittedDiff {
            version,
            client_id: client.to_string(),
            steps: vec![step("r")],
        }
    }

    fn client() -> SyncClient<IdentityRebaser> {
        SyncClient::new("c1", 5, IdentityRebaser)
    }

    /// Records the missed-diff versions of every rebase call.
    struct RecordingRebaser {
        calls: Rc<RefCell<Vec<Vec<u64>>>>,
    }

    impl StepRebaser for RecordingRebaser {
        fn rebase(&self, pending: Vec<Step>, missed: &[CommittedDiff]) -> Vec<Step> {
            self.calls
                .borrow_mut()
                .push(missed.iter().map(|d| d.version).collect());
            pending
        }
    }

    #[test]
    fn local_edit_sends_from_idle() {
        let mut c = client();
        let actions = c.local_edit(vec![step("a")]);
        match &actions[..] {
            [Action::Send(env)] => {
                assert_eq!(env.base_version, 5);
                assert_eq!(env.client_id, "c1");
            }
            other => panic!("unexpected actions: {other:?}"),
        }
        assert!(!c.is_idle());
    }

    #[test]
    fn edits_while_pending_are_buffered_and_flushed_on_ack() {
        let mut c = client();
        let first = c.local_edit(vec![step("a")]);
        let Action::Send(env) = &first[0] else {
            panic!("expected send")
        };
        let rid = env.request_id;

        assert!(c.local_edit(vec![step("b")]).is_empty());
        assert!(c.local_edit(vec![step("c")]).is_empty());

        let actions = c.ack(rid, 6);
        match &actions[..] {
            [Action::Send(next)] => {
                assert_eq!(next.base_version, 6);
                assert_eq!(next.steps.len(), 2);
                assert_ne!(next.request_id, rid);
            }
            other => panic!("unexpected actions: {other:?}"),
        }
        assert_eq!(c.known_version(), 6);
        assert!(!c.is_idle());
    }

    #[test]
    fn ack_without_buffer_returns_to_idle() {
        let mut c = client();
        let actions = c.local_edit(vec![step("a")]);
        let Action::Send(env) = &actions[0] else {
            panic!("expected send")
        };
        assert!(c.ack(env.request_id, 6).is_empty());
        assert!(c.is_idle());
        assert_eq!(c.known_version(), 6);
    }

    #[test]
    fn remote_diff_applies_immediately_when_idle() {
        let mut c = client();
        let actions = c.remote_diff(diff(6, "c2"));
        assert_eq!(actions, vec![Action::Apply(vec![diff(6, "c2")])]);
        assert_eq!(c.known_version(), 6);
    }

    #[test]
    fn stale_remote_diff_is_ignored() {
        let mut c = client();
        assert!(c.remote_diff(diff(4, "c2")).is_empty());
        assert_eq!(c.known_version(), 5);
    }

    #[test]
    fn remote_diffs_held_while_pending_apply_after_ack() {
        let mut c = client();
        let actions = c.local_edit(vec![step("a")]);
        let Action::Send(env) = &actions[0] else {
            panic!("expected send")
        };
        let rid = env.request_id;

        assert!(c.remote_diff(diff(7, "c2")).is_empty());
        assert!(c.remote_diff(diff(8, "c3")).is_empty());

        let actions = c.ack(rid, 6);
        assert_eq!(
            actions,
            vec![Action::Apply(vec![diff(7, "c2"), diff(8, "c3")])]
        );
        assert_eq!(c.known_version(), 8);
        assert!(c.is_idle());
    }

    #[test]
    fn buffered_steps_cross_released_diffs_on_ack() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut c = SyncClient::new(
            "c1",
            5,
            RecordingRebaser {
                calls: calls.clone(),
            },
        );
        let actions = c.local_edit(vec![step("a")]);
        let Action::Send(env) = &actions[0] else {
            panic!("expected send")
        };
        let rid = env.request_id;

        // A local edit and a remote commit both land during the round trip.
        assert!(c.local_edit(vec![step("b")]).is_empty());
        assert!(c.remote_diff(diff(7, "c2")).is_empty());

        let actions = c.ack(rid, 6);
        match &actions[..] {
            [Action::Apply(released), Action::Send(next)] => {
                assert_eq!(released.len(), 1);
                assert_eq!(next.base_version, 7);
            }
            other => panic!("unexpected actions: {other:?}"),
        }
        // The buffered edit must have been transformed over v7 before it
        // went out claiming base 7.
        assert_eq!(*calls.borrow(), vec![vec![7]]);
    }

    #[test]
    fn duplicate_held_versions_apply_once() {
        let mut c = client();
        let actions = c.local_edit(vec![step("a")]);
        let Action::Send(env) = &actions[0] else {
            panic!("expected send")
        };
        let rid = env.request_id;

        // The same commit delivered twice while pending, e.g. by a catch-up
        // reply racing a broadcast.
        assert!(c.remote_diff(diff(7, "c2")).is_empty());
        assert!(c.remote_diff(diff(7, "c2")).is_empty());

        let actions = c.ack(rid, 6);
        assert_eq!(actions, vec![Action::Apply(vec![diff(7, "c2")])]);
        assert_eq!(c.known_version(), 7);
    }

    #[test]
    fn rebase_applies_missed_and_resends_with_new_base() {
        let mut c = client();
        let actions = c.local_edit(vec![step("a")]);
        let Action::Send(env) = &actions[0] else {
            panic!("expected send")
        };
        let rid = env.request_id;

        let actions = c.rebase(rid, vec![diff(6, "c2")]);
        match &actions[..] {
            [Action::Apply(missed), Action::Send(next)] => {
                assert_eq!(missed.len(), 1);
                assert_eq!(next.base_version, 6);
                assert_eq!(next.request_id, rid);
            }
            other => panic!("unexpected actions: {other:?}"),
        }
        assert_eq!(c.known_version(), 6);
        assert!(!c.is_idle());
    }

    #[test]
    fn rebase_deduplicates_diffs_already_held() {
        let mut c = client();
        let actions = c.local_edit(vec![step("a")]);
        let Action::Send(env) = &actions[0] else {
            panic!("expected send")
        };
        let rid = env.request_id;

        // The same commit arrives both as a broadcast and in the missed
        // slice; it must be applied exactly once.
        assert!(c.remote_diff(diff(6, "c2")).is_empty());
        let actions = c.rebase(rid, vec![diff(6, "c2")]);
        match &actions[..] {
            [Action::Apply(missed), Action::Send(_)] => assert_eq!(missed.len(), 1),
            other => panic!("unexpected actions: {other:?}"),
        }

        let actions = c.ack(rid, 7);
        assert!(actions.is_empty(), "held duplicate must not reapply: {actions:?}");
        assert_eq!(c.known_version(), 7);
    }

    #[test]
    fn timeout_resets_to_idle_and_requests_resync() {
        let mut c = client();
        c.local_edit(vec![step("a")]);
        c.local_edit(vec![step("b")]);
        assert_eq!(c.timeout(), vec![Action::Resync]);
        assert!(c.is_idle());

        c.resynced(9);
        assert_eq!(c.known_version(), 9);
        let actions = c.local_edit(vec![step("c")]);
        let Action::Send(env) = &actions[0] else {
            panic!("expected send")
        };
        assert_eq!(env.base_version, 9);
    }

    #[test]
    fn ack_for_unknown_request_is_ignored() {
        let mut c = client();
        assert!(c.ack(42, 6).is_empty());
        assert_eq!(c.known_version(), 5);
    }
}
