//! Completion signals keyed by segment id.
//!
//! Flush and migration both finish segments in id order, so each is tracked
//! as a monotonic "highest finished id" plus the set of ids that finished
//! with an error. Waiting on id `n` returns once `n` (and therefore every
//! earlier id) has finished.

use lgc_types::SegmentId;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, PoisonError};

/// Why a wait did not report success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The segment finished, but with this error.
    Failed(String),
    /// The notifier was closed before the segment finished.
    Closed,
}

#[derive(Debug)]
struct ProgressState {
    finished: u64,
    failures: BTreeMap<u64, String>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct ProgressNotifier {
    state: Mutex<ProgressState>,
    condvar: Condvar,
}

impl ProgressNotifier {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                finished: 0,
                failures: BTreeMap::new(),
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn outcome(state: &ProgressState, id: SegmentId) -> Option<Result<(), WaitError>> {
        if id.0 <= state.finished {
            return Some(match state.failures.get(&id.0) {
                Some(detail) => Err(WaitError::Failed(detail.clone())),
                None => Ok(()),
            });
        }
        if state.closed {
            return Some(Err(WaitError::Closed));
        }
        None
    }

    /// Block until `id` has finished. [`SegmentId::INVALID`] is always
    /// finished.
    pub(crate) fn wait(&self, id: SegmentId) -> Result<(), WaitError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = Self::outcome(&state, id) {
                return outcome;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Record that `id` finished. Wakes all waiters.
    pub(crate) fn finish(&self, id: SegmentId, result: Result<(), String>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(detail) = result {
                state.failures.insert(id.0, detail);
            }
            if id.0 > state.finished {
                state.finished = id.0;
            }
        }
        self.condvar.notify_all();
    }

    /// Highest finished id.
    pub(crate) fn last_finished(&self) -> SegmentId {
        SegmentId(
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finished,
        )
    }

    /// Lowest id that finished with an error.
    pub(crate) fn first_failure(&self) -> Option<(SegmentId, String)> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failures
            .first_key_value()
            .map(|(id, detail)| (SegmentId(*id), detail.clone()))
    }

    /// Fail every current and future wait on an unfinished id.
    pub(crate) fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.condvar.notify_all();
    }
}
