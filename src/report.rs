//! Subscribe to events of the build engine.
//!
//! The executor, scheduler and cache coordinator emit progress through the
//! reporter installed for the current scope. By default events are forwarded
//! to [`tracing`]; installing a [`Reporter`] lets a front-end render progress
//! however it likes.
//!
//! A reporter is installed either globally with [`set_default`] or for the
//! current thread with [`set_scoped`], mirroring how `tracing` dispatchers
//! work.

use crate::target::{ActionKind, TargetId};
use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use yansi::Paint;

/// Cache interactions observable from the outside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { target: TargetId },
    Miss { target: TargetId },
    Write { target: TargetId },
    Evict { entries: usize, bytes: u64 },
}

/// Trait representing the functions required to emit build progress.
#[auto_impl::auto_impl(&, Arc)]
pub trait Reporter: Send + Sync + fmt::Debug {
    /// A build node started executing.
    fn on_node_started(&self, _target: &TargetId) {}

    /// A build node finished, successfully or not.
    fn on_node_finished(&self, _target: &TargetId, _success: bool, _elapsed: Duration) {}

    /// A target was satisfied from cache without executing its handler.
    fn on_node_cached(&self, _target: &TargetId) {}

    /// A node failed and its transitive dependents were marked failed.
    fn on_cascade(&self, _failed: &TargetId, _dependents: usize) {}

    /// A cache event occurred.
    fn on_cache_event(&self, _event: &CacheEvent) {}

    /// Discoveries submitted by `discoverer` were applied to the graph.
    fn on_discovery_applied(&self, _discoverer: &TargetId, _new_nodes: usize) {}

    /// A checkpoint snapshot was written.
    fn on_checkpoint_written(&self, _remaining: usize) {}

    /// An action was dispatched to a remote worker.
    fn on_remote_dispatch(&self, _target: &TargetId, _kind: ActionKind) {}
}

/// Default reporter that forwards everything to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn on_node_started(&self, target: &TargetId) {
        trace!(%target, "node started");
    }

    fn on_node_finished(&self, target: &TargetId, success: bool, elapsed: Duration) {
        trace!(%target, success, ?elapsed, "node finished");
    }

    fn on_node_cached(&self, target: &TargetId) {
        trace!(%target, "node cached");
    }

    fn on_cascade(&self, failed: &TargetId, dependents: usize) {
        debug!(%failed, dependents, "cascading failure");
    }

    fn on_cache_event(&self, event: &CacheEvent) {
        trace!(?event, "cache event");
    }

    fn on_discovery_applied(&self, discoverer: &TargetId, new_nodes: usize) {
        debug!(%discoverer, new_nodes, "discovery applied");
    }

    fn on_checkpoint_written(&self, remaining: usize) {
        debug!(remaining, "checkpoint written");
    }

    fn on_remote_dispatch(&self, target: &TargetId, kind: ActionKind) {
        trace!(%target, %kind, "remote dispatch");
    }
}

/// A reporter that counts events, useful in tests and for summaries.
#[derive(Debug, Default)]
pub struct CountingReporter {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    pub cached: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub cache_misses: AtomicUsize,
}

impl Reporter for CountingReporter {
    fn on_node_started(&self, _target: &TargetId) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_node_finished(&self, _target: &TargetId, _success: bool, _elapsed: Duration) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    fn on_node_cached(&self, _target: &TargetId) {
        self.cached.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cache_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Hit { .. } => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            CacheEvent::Miss { .. } => self.cache_misses.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }
}

/// Container for the installed reporter.
#[derive(Clone, Debug)]
pub struct Report(Arc<dyn Reporter>);

impl Report {
    pub fn new(reporter: impl Reporter + 'static) -> Self {
        Self(Arc::new(reporter))
    }
}

impl Default for Report {
    fn default() -> Self {
        Self(Arc::new(TracingReporter))
    }
}

impl std::ops::Deref for Report {
    type Target = dyn Reporter;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

static GLOBAL: Mutex<Option<Report>> = Mutex::new(None);

thread_local! {
    static SCOPED: RefCell<Option<Report>> = const { RefCell::new(None) };
}

/// Installs the reporter as the process-wide default.
pub fn set_default(reporter: impl Reporter + 'static) {
    *GLOBAL.lock().unwrap() = Some(Report::new(reporter));
}

/// Installs the reporter for the current thread, restoring the previous one on drop.
///
/// Worker threads of a scheduler pool inherit the report that was current when
/// the pool was built, see [`get_default`].
pub fn set_scoped(report: &Report) -> impl Drop {
    struct Guard(Option<Report>);
    impl Drop for Guard {
        fn drop(&mut self) {
            SCOPED.with(|s| *s.borrow_mut() = self.0.take());
        }
    }
    let prev = SCOPED.with(|s| s.borrow_mut().replace(report.clone()));
    Guard(prev)
}

/// Runs `f` with the reporter current for this thread.
pub fn get_default<T>(f: impl FnOnce(&Report) -> T) -> T {
    SCOPED.with(|scoped| {
        if let Some(report) = scoped.borrow().as_ref() {
            return f(report);
        }
        if let Some(report) = GLOBAL.lock().unwrap().as_ref() {
            return f(report);
        }
        f(&Report::default())
    })
}

/// Renders a failed target for terminal output: target, action kind, diagnostic
/// code and the first lines of captured output.
pub fn render_failure(
    target: &TargetId,
    kind: ActionKind,
    code: &str,
    output: &str,
    max_lines: usize,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("{} {target} ({kind}) [{code}]\n", Paint::red("FAILED").bold()));
    for line in output.lines().take(max_lines) {
        out.push_str("  | ");
        out.push_str(line);
        out.push('\n');
    }
    let total = output.lines().count();
    if total > max_lines {
        out.push_str(&format!("  … {} more lines\n", total - max_lines));
    }
    out
}
