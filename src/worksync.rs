//! Single-writer queues for sinks that are not safe under concurrent
//! mutation. Callers enqueue a unit of work and block until their own unit
//! has run; whichever caller wins the sink lock drains everything queued, so
//! work for one sink is serialized while different sinks proceed in parallel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// A unit of work against a sink of type `S`.
pub trait Work<S: ?Sized>: Send {
    fn apply(self, sink: &mut S) -> Result<()>;
}

struct Completion {
    result: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.cond.notify_all();
    }

    fn try_take(&self) -> Option<Result<()>> {
        self.result.lock().take()
    }

    fn wait(&self, timeout: Duration) -> Option<Result<()>> {
        let mut guard = self.result.lock();
        if guard.is_none() {
            self.cond.wait_for(&mut guard, timeout);
        }
        guard.take()
    }
}

struct Unit<W> {
    work: W,
    done: Arc<Completion>,
}

/// Work-sync coordinator: first caller in drains all queued units.
pub struct WorkSync<S, W: Work<S>> {
    sink: Mutex<S>,
    queue: Mutex<VecDeque<Unit<W>>>,
}

impl<S, W: Work<S>> WorkSync<S, W> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Runs `work` against the sink, serialized with every other caller.
    /// Returns once this caller's unit has executed, whichever thread ended
    /// up draining it.
    pub fn apply(&self, work: W) -> Result<()> {
        let done = Arc::new(Completion::new());
        self.queue.lock().push_back(Unit {
            work,
            done: Arc::clone(&done),
        });
        loop {
            if let Some(result) = done.try_take() {
                return result;
            }
            if let Some(mut sink) = self.sink.try_lock() {
                loop {
                    let unit = self.queue.lock().pop_front();
                    match unit {
                        Some(unit) => {
                            let result = unit.work.apply(&mut sink);
                            unit.done.complete(result);
                        }
                        None => break,
                    }
                }
                drop(sink);
                if let Some(result) = done.try_take() {
                    return result;
                }
                // Our unit raced in behind another drainer; go around.
            } else if let Some(result) = done.wait(Duration::from_millis(10)) {
                return result;
            }
        }
    }

    /// Direct access for callers that already own the serialization, e.g.
    /// the checkpoint barrier.
    pub fn with_sink<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        let mut sink = self.sink.lock();
        f(&mut sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        value: usize,
        max_in_flight: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
    }

    struct Add(usize);

    impl Work<Counter> for Add {
        fn apply(self, sink: &mut Counter) -> Result<()> {
            let now = sink.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            sink.max_in_flight.fetch_max(now, Ordering::SeqCst);
            sink.value += self.0;
            std::thread::sleep(Duration::from_micros(50));
            sink.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn all_units_run_exactly_once_and_serialized() {
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let sync = Arc::new(WorkSync::new(Counter {
            value: 0,
            max_in_flight: Arc::clone(&max_in_flight),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let sync = Arc::clone(&sync);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        sync.apply(Add(1)).expect("work never fails");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("worker panicked");
        }

        assert_eq!(sync.with_sink(|sink| sink.value), 8 * 50);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    struct Failing;

    impl Work<Counter> for Failing {
        fn apply(self, _sink: &mut Counter) -> Result<()> {
            Err(crate::error::StoreError::ApplyFailure("boom".into()))
        }
    }

    #[test]
    fn failures_reach_the_enqueuing_caller() {
        let sync = WorkSync::new(Counter {
            value: 0,
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        });
        let result: Result<()> = sync.apply(Failing);
        assert!(result.is_err());
    }
}
