//! Correlates submitted remote actions with their completions.
//!
//! The executing worker registers an action, submits it and blocks on the
//! registration's condition variable; the transport's background thread
//! delivers the completion and signals. Registration must happen before the
//! wait, otherwise a completion racing the submit could be lost.

use super::protocol::ActionCompletion;
use crate::error::{BuildError, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

#[derive(Debug, Default)]
struct Slot {
    completion: Mutex<Option<ActionCompletion>>,
    signal: Condvar,
}

/// Tracks in-flight remote actions keyed by action id.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action before submission. The returned handle is the
    /// only way to wait.
    pub fn register(&self, action_id: impl Into<String>) -> Registration<'_> {
        let action_id = action_id.into();
        let slot = Arc::new(Slot::default());
        self.slots.lock().unwrap().insert(action_id.clone(), slot.clone());
        Registration { tracker: self, action_id, slot }
    }

    /// Delivers a completion. Returns `false` when no registration exists
    /// (late or duplicate completions are dropped).
    pub fn complete(&self, completion: ActionCompletion) -> bool {
        let slot = match self.slots.lock().unwrap().get(&completion.action_id) {
            Some(slot) => slot.clone(),
            None => {
                debug!(action = %completion.action_id, "completion for unregistered action dropped");
                return false;
            }
        };
        *slot.completion.lock().unwrap() = Some(completion);
        slot.signal.notify_all();
        true
    }

    /// Number of in-flight registrations.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered action; deregisters on drop.
#[derive(Debug)]
pub struct Registration<'a> {
    tracker: &'a CompletionTracker,
    action_id: String,
    slot: Arc<Slot>,
}

impl Registration<'_> {
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Blocks until the completion arrives or `timeout` expires.
    pub fn wait(&self, timeout: Duration) -> Result<ActionCompletion> {
        let mut completion = self.slot.completion.lock().unwrap();
        let mut remaining = timeout;
        loop {
            if let Some(completion) = completion.take() {
                return Ok(completion);
            }
            let started = std::time::Instant::now();
            let (guard, wait) =
                self.slot.signal.wait_timeout(completion, remaining).unwrap();
            completion = guard;
            if wait.timed_out() && completion.is_none() {
                return Err(BuildError::ProcessTimeout {
                    target: self.action_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            remaining = remaining.saturating_sub(started.elapsed());
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.tracker.slots.lock().unwrap().remove(&self.action_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::protocol::RemoteStatus;
    use std::{sync::Arc as StdArc, thread, time::Instant};

    #[test]
    fn completion_wakes_waiter() {
        let tracker = StdArc::new(CompletionTracker::new());
        let registration = tracker.register("a1");

        let signaller = tracker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(signaller.complete(ActionCompletion::new("a1", RemoteStatus::Success)));
        });

        let completion = registration.wait(Duration::from_secs(5)).unwrap();
        assert!(completion.is_success());
        handle.join().unwrap();
    }

    #[test]
    fn completion_before_wait_is_not_lost() {
        let tracker = CompletionTracker::new();
        let registration = tracker.register("a1");
        tracker.complete(ActionCompletion::new("a1", RemoteStatus::Failed));
        let completion = registration.wait(Duration::from_millis(1)).unwrap();
        assert_eq!(completion.status, RemoteStatus::Failed);
    }

    #[test]
    fn timed_wait_returns_timeout() {
        let tracker = CompletionTracker::new();
        let registration = tracker.register("a1");
        let started = Instant::now();
        let err = registration.wait(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, BuildError::ProcessTimeout { .. }), "{err}");
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn unregistered_completion_is_dropped() {
        let tracker = CompletionTracker::new();
        assert!(!tracker.complete(ActionCompletion::new("ghost", RemoteStatus::Success)));
    }

    #[test]
    fn registration_deregisters_on_drop() {
        let tracker = CompletionTracker::new();
        {
            let _registration = tracker.register("a1");
            assert_eq!(tracker.len(), 1);
        }
        assert!(tracker.is_empty());
    }
}
