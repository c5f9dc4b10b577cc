//! Per-partition handshake between the matching observer and its two
//! extraction workers.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::Side;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub source_complete: bool,
    pub target_complete: bool,
    pub source_waiting: bool,
    pub target_waiting: bool,
    pub loader_complete: usize,
}

impl GateSnapshot {
    pub fn both_complete(&self) -> bool {
        self.source_complete && self.target_complete
    }

    pub fn either_complete(&self) -> bool {
        self.source_complete || self.target_complete
    }

    pub fn both_waiting(&self) -> bool {
        self.source_waiting && self.target_waiting
    }
}

/// Flags plus wake-up, no payload. Every flag transition goes through one lock.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateSnapshot>,
    notify: Notify,
    abort: CancellationToken,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GateSnapshot> {
        // Flags stay consistent even if a holder panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> GateSnapshot {
        *self.state()
    }

    /// Block until the next `notify_all` (or until the gate is aborted).
    ///
    /// The waiter registers before the waiting flag is published, so a
    /// notification sent as soon as the observer sees the flag cannot be lost.
    pub async fn wait(&self, side: Side) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.abort.is_cancelled() {
            return;
        }
        self.set_waiting(side, true);

        tokio::select! {
            _ = &mut notified => {}
            _ = self.abort.cancelled() => {}
        }

        self.set_waiting(side, false);
    }

    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    fn set_waiting(&self, side: Side, waiting: bool) {
        let mut state = self.state();
        match side {
            Side::Source => state.source_waiting = waiting,
            Side::Target => state.target_waiting = waiting,
        }
    }

    /// Set-once; never cleared for the life of the partition.
    pub fn mark_complete(&self, side: Side) {
        {
            let mut state = self.state();
            match side {
                Side::Source => state.source_complete = true,
                Side::Target => state.target_complete = true,
            }
        }
        self.notify_all();
    }

    pub fn loader_finished(&self) {
        self.state().loader_complete += 1;
    }

    /// Release every waiter for good. Used when the observer gives up.
    pub fn abort(&self) {
        self.abort.cancel();
        self.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_until_waiting(gate: &Gate, side: Side) {
        for _ in 0..200 {
            let s = gate.snapshot();
            let waiting = match side {
                Side::Source => s.source_waiting,
                Side::Target => s.target_waiting,
            };
            if waiting {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never started waiting", side);
    }

    #[tokio::test]
    async fn test_notify_releases_both_waiters() {
        let gate = Arc::new(Gate::new());
        let mut handles = Vec::new();
        for side in [Side::Source, Side::Target] {
            let g = gate.clone();
            handles.push(tokio::spawn(async move { g.wait(side).await }));
        }
        wait_until_waiting(&gate, Side::Source).await;
        wait_until_waiting(&gate, Side::Target).await;
        assert!(gate.snapshot().both_waiting());

        gate.notify_all();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(!gate.snapshot().source_waiting);
        assert!(!gate.snapshot().target_waiting);
    }

    #[tokio::test]
    async fn test_abort_releases_and_short_circuits_waits() {
        let gate = Arc::new(Gate::new());
        let g = gate.clone();
        let handle = tokio::spawn(async move { g.wait(Side::Source).await });
        wait_until_waiting(&gate, Side::Source).await;

        gate.abort();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        // Later waits return immediately.
        tokio::time::timeout(Duration::from_millis(100), gate.wait(Side::Target))
            .await
            .unwrap();
    }

    #[test]
    fn test_completion_flags_are_monotonic() {
        let gate = Gate::new();
        gate.mark_complete(Side::Target);
        gate.mark_complete(Side::Target);
        gate.loader_finished();
        gate.loader_finished();

        let s = gate.snapshot();
        assert!(s.target_complete);
        assert!(s.either_complete());
        assert!(!s.both_complete());
        assert_eq!(s.loader_complete, 2);
    }
}
