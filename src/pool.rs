//! Bounded pool of background worker threads.
//!
//! Blocking work (subprocesses, file hashing) runs on plain spawned threads
//! that report completion over an mpsc channel back to the task thread.
//! At most `limit` jobs run at once; submissions beyond that queue until a
//! slot frees.  The task thread collects completions from `drain_one`, which
//! is only ever called when a `wait` has nothing else to do.

use crate::flow::{Future, Runtime};
use crate::value::{Outcome, TaskError};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::mpsc;

/// Worker threads send back a type-erased `Outcome<T>`; the satisfier stored
/// at submit time knows the concrete type.
type Payload = Box<dyn Any + Send>;
type Satisfier = Box<dyn FnOnce(&Runtime, Option<Payload>)>;

pub struct JobPool {
    limit: usize,
    tx: mpsc::Sender<(u64, Payload)>,
    rx: mpsc::Receiver<(u64, Payload)>,
    next_id: Cell<u64>,
    running: Cell<usize>,
    queued: RefCell<VecDeque<(u64, Box<dyn FnOnce() -> Payload + Send>)>>,
    satisfiers: RefCell<FxHashMap<u64, Satisfier>>,
    cancelled: Cell<bool>,
}

impl JobPool {
    pub fn new(limit: usize) -> JobPool {
        let (tx, rx) = mpsc::channel();
        JobPool {
            limit: limit.max(1),
            tx,
            rx,
            next_id: Cell::new(0),
            running: Cell::new(0),
            queued: RefCell::new(VecDeque::new()),
            satisfiers: RefCell::new(FxHashMap::default()),
            cancelled: Cell::new(false),
        }
    }

    pub fn submit<T: Send + 'static>(
        &self,
        _rt: &Runtime,
        job: impl FnOnce() -> Outcome<T> + Send + 'static,
    ) -> Future<T> {
        if self.cancelled.get() {
            return Future::failed(TaskError::msg("background pool shut down"));
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let out = Future::pending();
        let out2 = out.clone();
        self.satisfiers.borrow_mut().insert(
            id,
            Box::new(move |rt, payload| {
                let o = match payload {
                    Some(p) => *p
                        .downcast::<Outcome<T>>()
                        .expect("job payload type mismatch"),
                    None => Err(TaskError::msg("background job cancelled")),
                };
                out2.resolve(rt, o);
            }),
        );

        let thunk: Box<dyn FnOnce() -> Payload + Send> =
            Box::new(move || Box::new(job()) as Payload);
        if self.running.get() < self.limit {
            self.launch(id, thunk);
        } else {
            self.queued.borrow_mut().push_back((id, thunk));
        }
        out
    }

    fn launch(&self, id: u64, thunk: Box<dyn FnOnce() -> Payload + Send>) {
        self.running.set(self.running.get() + 1);
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            let payload = thunk();
            // The receiver only goes away at process exit.
            let _ = tx.send((id, payload));
        });
    }

    /// Block for one completed job and deliver its outcome.  Returns false
    /// when nothing is in flight, which is how `wait` detects that a pending
    /// future can never resolve.
    pub fn drain_one(&self, rt: &Runtime) -> bool {
        if self.running.get() == 0 {
            return false;
        }
        let (id, payload) = self.rx.recv().expect("worker channel closed");
        self.running.set(self.running.get() - 1);
        if !self.cancelled.get() {
            if let Some((next_id, thunk)) = self.queued.borrow_mut().pop_front() {
                self.launch(next_id, thunk);
            }
        }
        let sat = self.satisfiers.borrow_mut().remove(&id);
        if let Some(sat) = sat {
            let payload = if self.cancelled.get() { None } else { Some(payload) };
            sat(rt, payload);
        }
        true
    }

    /// Fail every queued job now and mark in-flight ones so their results
    /// are discarded when they land.  Later submissions fail immediately.
    pub fn cancel(&self, rt: &Runtime) {
        self.cancelled.set(true);
        let queued: Vec<u64> = self
            .queued
            .borrow_mut()
            .drain(..)
            .map(|(id, _)| id)
            .collect();
        for id in queued {
            let sat = self.satisfiers.borrow_mut().remove(&id);
            if let Some(sat) = sat {
                sat(rt, None);
            }
        }
    }
}

/// How many background jobs may run at once: the `RETRACE_THREADS` override
/// if set, otherwise 75% of the CPUs on machines with at least four so the
/// task thread and the rest of the system keep breathing room.
pub fn concurrency_limit() -> usize {
    if let Ok(s) = std::env::var("RETRACE_THREADS") {
        if let Ok(n) = s.parse::<usize>() {
            if n > 0 {
                return n;
            }
        }
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cpus >= 4 {
        (cpus * 3) / 4
    } else {
        cpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_at_least_one() {
        assert!(concurrency_limit() >= 1);
        // A zero limit is clamped: jobs still run.
        let rt = crate::flow::Runtime::with_limit(0);
        let fut = rt.submit(|| Ok(7i64));
        assert_eq!(*rt.wait(&fut), Ok(7));
    }
}
