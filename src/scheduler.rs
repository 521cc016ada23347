//! Parallel scheduling of ready build nodes.
//!
//! The scheduler keeps a shared ready queue of node ids and a work-stealing
//! pool of worker threads. Jobs a batch distributes land on per-worker local
//! deques (LIFO for the owner, FIFO for thieves); the shared injector queue
//! takes the overflow. The coordinator blocks on a condition variable while
//! nodes are in flight and none are ready.
//!
//! Between two independent ready nodes the execution order is arbitrary;
//! nothing here may be relied on beyond the dependency ordering the build
//! graph established.

use crate::graph::NodeId;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

/// Cooperative cancellation handle, propagated into the scheduler.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One worker's deque. The owner pushes and pops at the back; thieves take
/// from the front. `bottom` mirrors the length so thieves can skip empty
/// queues without touching the mutex.
#[derive(Default)]
struct WorkerQueue {
    deque: Mutex<VecDeque<Job>>,
    bottom: AtomicUsize,
}

impl WorkerQueue {
    fn push(&self, job: Job) {
        let mut deque = self.deque.lock().unwrap();
        deque.push_back(job);
        self.bottom.store(deque.len(), Ordering::Release);
    }

    /// LIFO pop for the owning worker.
    fn pop(&self) -> Option<Job> {
        if self.bottom.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut deque = self.deque.lock().unwrap();
        let job = deque.pop_back();
        self.bottom.store(deque.len(), Ordering::Release);
        job
    }

    /// FIFO steal for other workers.
    fn steal(&self) -> Option<Job> {
        if self.bottom.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut deque = self.deque.lock().unwrap();
        let job = deque.pop_front();
        self.bottom.store(deque.len(), Ordering::Release);
        job
    }
}

struct PoolShared {
    locals: Vec<WorkerQueue>,
    injector: Mutex<VecDeque<Job>>,
    /// Outstanding jobs (queued or running), guarded by `gate`.
    gate: Mutex<PoolGate>,
    work_available: Condvar,
}

#[derive(Default)]
struct PoolGate {
    queued: usize,
    shutdown: bool,
}

impl PoolShared {
    /// Own deque first, then the injector, then steal round-robin.
    fn find_job(&self, worker: usize) -> Option<Job> {
        if let Some(job) = self.locals[worker].pop() {
            return Some(job);
        }
        if let Some(job) = self.injector.lock().unwrap().pop_front() {
            return Some(job);
        }
        let count = self.locals.len();
        for offset in 1..count {
            if let Some(job) = self.locals[(worker + offset) % count].steal() {
                return Some(job);
            }
        }
        None
    }
}

/// Fixed-size work-stealing thread pool.
struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(workers: usize) -> Self {
        let shared = Arc::new(PoolShared {
            locals: (0..workers).map(|_| WorkerQueue::default()).collect(),
            injector: Mutex::new(VecDeque::new()),
            gate: Mutex::new(PoolGate::default()),
            work_available: Condvar::new(),
        });

        let report = crate::report::get_default(|r| r.clone());
        let handles = (0..workers)
            .map(|worker| {
                let shared = shared.clone();
                let report = report.clone();
                thread::Builder::new()
                    .name(format!("polybuild-worker-{worker}"))
                    .spawn(move || {
                        let _guard = crate::report::set_scoped(&report);
                        worker_loop(&shared, worker);
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, handles }
    }

    /// Queues `jobs`, spreading them across the local deques round-robin
    /// with the overflow going to the injector.
    fn dispatch(&self, jobs: Vec<Job>) {
        let workers = self.shared.locals.len();
        let count = jobs.len();
        for (idx, job) in jobs.into_iter().enumerate() {
            if idx < workers {
                self.shared.locals[idx % workers].push(job);
            } else {
                self.shared.injector.lock().unwrap().push_back(job);
            }
        }
        let mut gate = self.shared.gate.lock().unwrap();
        gate.queued += count;
        drop(gate);
        self.shared.work_available.notify_all();
    }

    /// Drains remaining work, then joins all workers.
    fn shutdown(self) {
        {
            let mut gate = self.shared.gate.lock().unwrap();
            gate.shutdown = true;
        }
        self.shared.work_available.notify_all();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared, worker: usize) {
    loop {
        let job = {
            let mut gate = shared.gate.lock().unwrap();
            loop {
                if gate.queued > 0 {
                    break;
                }
                if gate.shutdown {
                    return;
                }
                gate = shared.work_available.wait(gate).unwrap();
            }
            match shared.find_job(worker) {
                Some(job) => {
                    gate.queued -= 1;
                    job
                }
                // another worker took the job between the counter check and
                // the queue scan, go back to waiting
                None => continue,
            }
        };
        job();
    }
}

/// Outcome of waiting for schedulable work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one node is ready.
    Ready,
    /// No node is ready and nothing is in flight.
    Idle,
    Cancelled,
}

/// The scheduler: ready queue + worker pool + coordinator blocking.
pub struct Scheduler {
    pool: WorkerPool,
    ready: Mutex<VecDeque<NodeId>>,
    ready_or_done: Condvar,
    /// Nodes currently executing in a batch.
    active: AtomicUsize,
    cancel: CancelToken,
    workers: usize,
}

impl Scheduler {
    /// `workers = 0` means one worker per available core.
    pub fn new(workers: usize, cancel: CancelToken) -> Self {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        debug!(workers, "starting scheduler pool");
        Self {
            pool: WorkerPool::new(workers),
            ready: Mutex::new(VecDeque::new()),
            ready_or_done: Condvar::new(),
            active: AtomicUsize::new(0),
            cancel,
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Adds a node to the ready queue. Submits after cancellation are
    /// refused.
    pub fn submit(&self, node: NodeId) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.ready.lock().unwrap().push_back(node);
        self.ready_or_done.notify_all();
        true
    }

    pub fn submit_all(&self, nodes: impl IntoIterator<Item = NodeId>) -> usize {
        nodes.into_iter().filter(|node| self.submit(*node)).count()
    }

    /// Atomically claims up to `max` ready nodes.
    pub fn dequeue_ready(&self, max: usize) -> Vec<NodeId> {
        let mut ready = self.ready.lock().unwrap();
        let take = max.min(ready.len());
        ready.drain(..take).collect()
    }

    /// Blocks until a node is ready, everything is done, or the build is
    /// cancelled.
    pub fn wait_for_ready(&self) -> WaitOutcome {
        let mut ready = self.ready.lock().unwrap();
        loop {
            if self.cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if !ready.is_empty() {
                return WaitOutcome::Ready;
            }
            if self.active.load(Ordering::Acquire) == 0 {
                return WaitOutcome::Idle;
            }
            ready = self.ready_or_done.wait(ready).unwrap();
        }
    }

    /// Runs `f` on every node of the batch in parallel on the pool and
    /// returns the results in batch order. `f` is side-effecting (it drives
    /// the executor); completions wake the coordinator.
    pub fn execute_batch<T, R, F>(&self, batch: Vec<T>, f: F) -> Vec<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let count = batch.len();
        if count == 0 {
            return Vec::new();
        }
        self.active.fetch_add(count, Ordering::AcqRel);

        let f = Arc::new(f);
        let (tx, rx) = mpsc::channel::<(usize, R)>();
        let jobs: Vec<Job> = batch
            .into_iter()
            .enumerate()
            .map(|(idx, item)| {
                let f = f.clone();
                let tx = tx.clone();
                Box::new(move || {
                    let result = f(item);
                    // the receiver may be gone if the coordinator bailed
                    let _ = tx.send((idx, result));
                }) as Job
            })
            .collect();
        drop(tx);
        self.pool.dispatch(jobs);

        let mut results: Vec<(usize, R)> = Vec::with_capacity(count);
        for received in rx {
            // the decrement must be visible before a waiter re-checks, so it
            // synchronizes through the ready mutex
            let guard = self.ready.lock().unwrap();
            self.active.fetch_sub(1, Ordering::AcqRel);
            drop(guard);
            self.ready_or_done.notify_all();
            results.push(received);
        }
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Graceful shutdown: refuses new submits, drains in-flight work and
    /// joins the pool.
    pub fn shutdown(self) {
        let guard = self.ready.lock().unwrap();
        self.cancel.cancel();
        drop(guard);
        self.ready_or_done.notify_all();
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("ready", &self.ready.lock().unwrap().len())
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, time::Duration};

    #[test]
    fn batch_results_preserve_order() {
        let scheduler = Scheduler::new(4, CancelToken::new());
        let results = scheduler.execute_batch((0..64).collect(), |n: i32| n * 2);
        assert_eq!(results, (0..64).map(|n| n * 2).collect::<Vec<_>>());
        scheduler.shutdown();
    }

    #[test]
    fn batch_runs_in_parallel() {
        let scheduler = Scheduler::new(4, CancelToken::new());
        let threads: HashSet<thread::ThreadId> = scheduler
            .execute_batch((0..16).collect(), |_: i32| {
                thread::sleep(Duration::from_millis(20));
                thread::current().id()
            })
            .into_iter()
            .collect();
        assert!(threads.len() > 1, "expected work on multiple workers, got {threads:?}");
        scheduler.shutdown();
    }

    #[test]
    fn ready_queue_claims_atomically() {
        let scheduler = Scheduler::new(1, CancelToken::new());
        scheduler.submit_all([NodeId(0), NodeId(1), NodeId(2)]);
        assert_eq!(scheduler.dequeue_ready(2), vec![NodeId(0), NodeId(1)]);
        assert_eq!(scheduler.dequeue_ready(10), vec![NodeId(2)]);
        assert!(scheduler.dequeue_ready(10).is_empty());
        scheduler.shutdown();
    }

    #[test]
    fn wait_reports_idle_when_nothing_runs() {
        let scheduler = Scheduler::new(1, CancelToken::new());
        assert_eq!(scheduler.wait_for_ready(), WaitOutcome::Idle);
        scheduler.submit(NodeId(7));
        assert_eq!(scheduler.wait_for_ready(), WaitOutcome::Ready);
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_scheduler_refuses_submits() {
        let cancel = CancelToken::new();
        let scheduler = Scheduler::new(1, cancel.clone());
        cancel.cancel();
        assert!(!scheduler.submit(NodeId(0)));
        assert_eq!(scheduler.wait_for_ready(), WaitOutcome::Cancelled);
        scheduler.shutdown();
    }

    #[test]
    fn idle_workers_steal_queued_work() {
        // one slow job pins the first worker; the rest must be stolen and
        // completed by the others
        let scheduler = Scheduler::new(4, CancelToken::new());
        let results = scheduler.execute_batch((0..32).collect(), |n: u64| {
            if n == 0 {
                thread::sleep(Duration::from_millis(100));
            }
            n
        });
        assert_eq!(results.len(), 32);
        scheduler.shutdown();
    }

    #[test]
    fn sequential_batches_reuse_the_pool() {
        let scheduler = Scheduler::new(2, CancelToken::new());
        for round in 0..10 {
            let results = scheduler.execute_batch(vec![round; 8], |n: i32| n + 1);
            assert_eq!(results, vec![round + 1; 8]);
        }
        scheduler.shutdown();
    }
}
