//! Bucketed timer wheel for key-expiry jobs.
//!
//! A single task owns the wheel; callers hold a cloneable handle and talk
//! to it over a command channel, so the wheel needs no locking of its own.
//! Scheduling with an already-present name replaces the old entry, and a
//! side index `name → (bucket, task id)` makes cancellation O(1). Due jobs
//! are dispatched each on its own spawned task so one slow callback cannot
//! stall the tick.

use std::time::Duration;

use ahash::AHashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// A deferred callback. Runs at most once.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default tick length.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Default bucket count: with a 100 ms tick, one full revolution is 6 min.
pub const DEFAULT_BUCKETS: usize = 3600;

enum Command {
    Schedule {
        name: String,
        delay: Duration,
        job: Job,
    },
    Cancel {
        name: String,
    },
    Stop,
}

/// Cloneable handle to a running wheel task.
#[derive(Clone)]
pub struct TimeWheel {
    tx: mpsc::UnboundedSender<Command>,
}

impl TimeWheel {
    /// Spawns the wheel task and returns its handle.
    pub fn start(tick: Duration, buckets: usize) -> Self {
        assert!(buckets > 0 && !tick.is_zero());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(tick, buckets, rx));
        Self { tx }
    }

    /// Schedules `job` to run after `delay`. An existing entry under the
    /// same name is replaced.
    pub fn schedule(&self, name: String, delay: Duration, job: Job) {
        let _ = self.tx.send(Command::Schedule { name, delay, job });
    }

    /// Cancels the entry under `name`, if any.
    pub fn cancel(&self, name: &str) {
        let _ = self.tx.send(Command::Cancel {
            name: name.to_owned(),
        });
    }

    /// Stops the wheel task. Pending jobs are dropped.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

struct Task {
    name: String,
    /// Remaining full revolutions before this task is due.
    circle: u64,
    job: Job,
}

struct Wheel {
    buckets: Vec<AHashMap<u64, Task>>,
    /// name → (bucket index, task id) for O(1) cancel/replace.
    index: AHashMap<String, (usize, u64)>,
    cursor: usize,
    tick: Duration,
    next_task_id: u64,
}

impl Wheel {
    fn new(tick: Duration, buckets: usize) -> Self {
        Self {
            buckets: (0..buckets).map(|_| AHashMap::new()).collect(),
            index: AHashMap::new(),
            cursor: 0,
            tick,
            next_task_id: 0,
        }
    }

    fn schedule(&mut self, name: String, delay: Duration, job: Job) {
        self.cancel(&name);

        let ticks = (delay.as_millis() / self.tick.as_millis().max(1)) as u64;
        let slots = self.buckets.len() as u64;
        let pos = ((self.cursor as u64 + ticks) % slots) as usize;
        let circle = ticks / slots;

        let id = self.next_task_id;
        self.next_task_id += 1;
        self.buckets[pos].insert(
            id,
            Task {
                name: name.clone(),
                circle,
                job,
            },
        );
        self.index.insert(name, (pos, id));
    }

    fn cancel(&mut self, name: &str) {
        if let Some((bucket, id)) = self.index.remove(name) {
            self.buckets[bucket].remove(&id);
        }
    }

    /// One tick: dispatch due tasks in the current bucket, age the rest,
    /// advance the cursor.
    fn advance(&mut self) {
        let bucket = std::mem::take(&mut self.buckets[self.cursor]);
        for (id, mut task) in bucket {
            if task.circle > 0 {
                task.circle -= 1;
                self.buckets[self.cursor].insert(id, task);
            } else {
                self.index.remove(&task.name);
                let job = task.job;
                tokio::spawn(async move { job() });
            }
        }
        self.cursor = (self.cursor + 1) % self.buckets.len();
    }
}

async fn run(tick: Duration, buckets: usize, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut wheel = Wheel::new(tick, buckets);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => wheel.advance(),
            cmd = rx.recv() => match cmd {
                Some(Command::Schedule { name, delay, job }) => wheel.schedule(name, delay, job),
                Some(Command::Cancel { name }) => wheel.cancel(&name),
                Some(Command::Stop) | None => {
                    debug!("time wheel stopping with {} pending entries", wheel.index.len());
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn fires_after_delay() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.schedule("t".into(), Duration::from_millis(30), counter_job(&fired));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wheel.stop();
    }

    #[tokio::test]
    async fn cancel_prevents_dispatch() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.schedule("t".into(), Duration::from_millis(50), counter_job(&fired));
        wheel.cancel("t");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wheel.stop();
    }

    #[tokio::test]
    async fn reschedule_replaces_previous_job() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 16);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        wheel.schedule("t".into(), Duration::from_millis(40), counter_job(&first));
        wheel.schedule("t".into(), Duration::from_millis(40), counter_job(&second));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        wheel.stop();
    }

    #[tokio::test]
    async fn delay_longer_than_one_revolution() {
        // 4 buckets of 10ms, so 120ms needs three full circles
        let wheel = TimeWheel::start(Duration::from_millis(10), 4);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.schedule("t".into(), Duration::from_millis(120), counter_job(&fired));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "fired a revolution early");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wheel.stop();
    }

    #[tokio::test]
    async fn zero_delay_fires_on_upcoming_tick() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.schedule("t".into(), Duration::ZERO, counter_job(&fired));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wheel.stop();
    }
}
