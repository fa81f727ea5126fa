//! Scheduling, clock and timer collaborators.
//!
//! The engine never spawns work of its own. Deferred work is submitted to a
//! [`Scheduler`] that runs jobs one at a time in submission order, and
//! deadlines are driven by a [`TimerService`]. Deterministic implementations
//! ([`ManualScheduler`], [`ManualTimers`]) are provided for tests.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs one at a time, in submission order.
pub trait Scheduler: Send + Sync {
    /// Queues `job` behind all previously submitted jobs.
    fn submit(&self, job: Job);
}

/// A scheduler drained explicitly by the caller.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Job>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued jobs.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the oldest queued job. Returns false if none was queued.
    pub fn run_one(&self) -> bool {
        let job = self.queue.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs, including ones submitted meanwhile, until the queue is
    /// empty. Returns the number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn submit(&self, job: Job) {
        self.queue.lock().push_back(job);
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A scheduler backed by one worker thread.
pub struct ThreadScheduler {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ThreadScheduler {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("flashlog-worker".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })?;
        let worker_id = worker.thread().id();
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }
}

impl Scheduler for ThreadScheduler {
    fn submit(&self, job: Job) {
        if let Some(sender) = self.sender.lock().as_ref() {
            if sender.send(job).is_err() {
                warn!("worker stopped, job discarded");
            }
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            // The last reference may be dropped by a job on the worker itself.
            if thread::current().id() != self.worker_id && worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadScheduler").finish_non_exhaustive()
    }
}

/// Source of time.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;

    /// Wall-clock seconds since the Unix epoch.
    fn unix_time(&self) -> u32;
}

/// The system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose monotonic origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn unix_time(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
    }
}

/// Identifier of a timer created by a [`TimerService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Callback run when a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// One-shot and repeating timers.
///
/// Callbacks run on the service's own context and must not block; they
/// normally just submit a job to a [`Scheduler`].
pub trait TimerService: Send + Sync {
    /// Creates a stopped timer.
    fn create(&self, callback: TimerCallback) -> TimerId;

    /// (Re)starts a timer to fire after `delay`, then every `delay` if
    /// `repeating`.
    fn start(&self, id: TimerId, delay: Duration, repeating: bool);

    /// Stops a timer without deleting it.
    fn stop(&self, id: TimerId);

    /// Deletes a timer.
    fn delete(&self, id: TimerId);
}

struct TimerSlot {
    callback: TimerCallback,
    deadline: Option<Duration>,
    period: Option<Duration>,
}

impl TimerSlot {
    fn arm(&mut self, now: Duration, delay: Duration, repeating: bool) {
        self.deadline = Some(now + delay);
        self.period = (repeating && !delay.is_zero()).then_some(delay);
    }

    /// Advances past a firing at `at`.
    fn rearm(&mut self, at: Duration) {
        self.deadline = self.period.map(|period| at + period);
    }
}

#[derive(Default)]
struct TimerTable {
    slots: HashMap<TimerId, TimerSlot>,
    next_id: u64,
}

impl TimerTable {
    fn create(&mut self, callback: TimerCallback) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.slots.insert(
            id,
            TimerSlot {
                callback,
                deadline: None,
                period: None,
            },
        );
        id
    }

    /// The armed timer with the earliest deadline, ties by creation order.
    fn earliest(&self) -> Option<(TimerId, Duration)> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| slot.deadline.map(|d| (*id, d)))
            .min_by_key(|(id, deadline)| (*deadline, id.0))
    }
}

struct ManualState {
    now: Duration,
    unix_base: u32,
    table: TimerTable,
}

/// Timers and clock advanced explicitly by the caller.
pub struct ManualTimers {
    state: Mutex<ManualState>,
}

impl ManualTimers {
    /// Creates stopped timers at monotonic time zero and the given wall time.
    #[must_use]
    pub fn new(unix_base: u32) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                unix_base,
                table: TimerTable::default(),
            }),
        }
    }

    /// Moves time forward by `by`, firing due timers in deadline order.
    ///
    /// Callbacks run without the internal lock held, so they may start or
    /// stop timers.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;
        loop {
            let callback = {
                let mut state = self.state.lock();
                let Some((id, deadline)) = state.table.earliest() else {
                    break;
                };
                if deadline > target {
                    break;
                }
                state.now = state.now.max(deadline);
                let Some(slot) = state.table.slots.get_mut(&id) else {
                    break;
                };
                slot.rearm(deadline);
                Arc::clone(&slot.callback)
            };
            callback();
        }
        let mut state = self.state.lock();
        state.now = state.now.max(target);
    }

    /// Returns the number of armed timers.
    pub fn armed(&self) -> usize {
        self.state
            .lock()
            .table
            .slots
            .values()
            .filter(|slot| slot.deadline.is_some())
            .count()
    }

    /// Returns the deadline of a timer if it is armed.
    pub fn deadline(&self, id: TimerId) -> Option<Duration> {
        self.state
            .lock()
            .table
            .slots
            .get(&id)
            .and_then(|slot| slot.deadline)
    }
}

impl Default for ManualTimers {
    fn default() -> Self {
        Self::new(1_700_000_000)
    }
}

impl Clock for ManualTimers {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn unix_time(&self) -> u32 {
        let state = self.state.lock();
        let secs = u32::try_from(state.now.as_secs()).unwrap_or(u32::MAX);
        state.unix_base.saturating_add(secs)
    }
}

impl TimerService for ManualTimers {
    fn create(&self, callback: TimerCallback) -> TimerId {
        self.state.lock().table.create(callback)
    }

    fn start(&self, id: TimerId, delay: Duration, repeating: bool) {
        let mut state = self.state.lock();
        let now = state.now;
        if let Some(slot) = state.table.slots.get_mut(&id) {
            slot.arm(now, delay, repeating);
        }
    }

    fn stop(&self, id: TimerId) {
        if let Some(slot) = self.state.lock().table.slots.get_mut(&id) {
            slot.deadline = None;
        }
    }

    fn delete(&self, id: TimerId) {
        self.state.lock().table.slots.remove(&id);
    }
}

impl std::fmt::Debug for ManualTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTimers")
            .field("now", &self.now())
            .field("armed", &self.armed())
            .finish()
    }
}

struct ThreadTimerShared {
    state: Mutex<ThreadTimerState>,
    wakeup: Condvar,
    origin: Instant,
}

struct ThreadTimerState {
    table: TimerTable,
    shutdown: bool,
}

/// Timers driven by a dedicated thread.
pub struct ThreadTimers {
    shared: Arc<ThreadTimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadTimers {
    /// Starts the timer thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(ThreadTimerShared {
            state: Mutex::new(ThreadTimerState {
                table: TimerTable::default(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            origin: Instant::now(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("flashlog-timers".into())
            .spawn(move || Self::run(&worker))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn run(shared: &ThreadTimerShared) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = shared.origin.elapsed();
            match state.table.earliest() {
                Some((id, deadline)) if deadline <= now => {
                    let Some(slot) = state.table.slots.get_mut(&id) else {
                        continue;
                    };
                    slot.rearm(deadline.max(now));
                    let callback = Arc::clone(&slot.callback);
                    drop(state);
                    trace!(timer = id.0, "timer fired");
                    callback();
                    state = shared.state.lock();
                }
                Some((_, deadline)) => {
                    let wait_until = Instant::now() + (deadline - now);
                    shared.wakeup.wait_until(&mut state, wait_until);
                }
                None => shared.wakeup.wait(&mut state),
            }
        }
    }
}

impl TimerService for ThreadTimers {
    fn create(&self, callback: TimerCallback) -> TimerId {
        self.shared.state.lock().table.create(callback)
    }

    fn start(&self, id: TimerId, delay: Duration, repeating: bool) {
        let now = self.shared.origin.elapsed();
        if let Some(slot) = self.shared.state.lock().table.slots.get_mut(&id) {
            slot.arm(now, delay, repeating);
        }
        self.shared.wakeup.notify_one();
    }

    fn stop(&self, id: TimerId) {
        if let Some(slot) = self.shared.state.lock().table.slots.get_mut(&id) {
            slot.deadline = None;
        }
        self.shared.wakeup.notify_one();
    }

    fn delete(&self, id: TimerId) {
        self.shared.state.lock().table.slots.remove(&id);
        self.shared.wakeup.notify_one();
    }
}

impl Drop for ThreadTimers {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThreadTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTimers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        (count, Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn manual_scheduler_runs_in_order() {
        let scheduler = Arc::new(ManualScheduler::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            scheduler.submit(Box::new(move || log.lock().push(i)));
        }
        assert_eq!(scheduler.pending(), 3);
        assert!(scheduler.run_one());
        assert_eq!(*log.lock(), vec![0]);
        assert_eq!(scheduler.run_until_idle(), 2);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(!scheduler.run_one());
    }

    #[test]
    fn manual_scheduler_runs_jobs_submitted_by_jobs() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = Arc::clone(&scheduler);
        let (count, callback) = counter();
        scheduler.submit(Box::new(move || {
            inner.submit(Box::new(move || callback()));
        }));
        assert_eq!(scheduler.run_until_idle(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_scheduler_preserves_order() {
        let scheduler = ThreadScheduler::new().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            scheduler.submit(Box::new(move || tx.send(i).unwrap()));
        }
        let received: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn manual_timers_fire_in_deadline_order() {
        let timers = ManualTimers::new(1000);
        let order = Arc::new(Mutex::new(Vec::new()));
        let ids: Vec<_> = [30u64, 10, 20]
            .into_iter()
            .map(|secs| {
                let order = Arc::clone(&order);
                let id = timers.create(Arc::new(move || order.lock().push(secs)));
                timers.start(id, Duration::from_secs(secs), false);
                id
            })
            .collect();

        timers.advance(Duration::from_secs(25));
        assert_eq!(*order.lock(), vec![10, 20]);
        assert_eq!(timers.now(), Duration::from_secs(25));
        assert_eq!(timers.unix_time(), 1025);
        assert_eq!(timers.deadline(ids[0]), Some(Duration::from_secs(30)));

        timers.advance(Duration::from_secs(10));
        assert_eq!(*order.lock(), vec![10, 20, 30]);
        assert_eq!(timers.armed(), 0);
    }

    #[test]
    fn manual_repeating_timer() {
        let timers = ManualTimers::default();
        let (count, callback) = counter();
        let id = timers.create(callback);
        timers.start(id, Duration::from_secs(5), true);

        timers.advance(Duration::from_secs(16));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        timers.stop(id);
        timers.advance(Duration::from_secs(60));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn manual_timer_restart_replaces_deadline() {
        let timers = ManualTimers::default();
        let (count, callback) = counter();
        let id = timers.create(callback);
        timers.start(id, Duration::from_secs(5), false);
        timers.start(id, Duration::from_secs(50), false);

        timers.advance(Duration::from_secs(10));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        timers.delete(id);
        timers.advance(Duration::from_secs(60));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn thread_timers_fire() {
        let timers = ThreadTimers::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let id = timers.create(Arc::new(move || {
            let _ = tx.lock().send(());
        }));
        timers.start(id, Duration::from_millis(10), false);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
