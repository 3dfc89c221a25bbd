//! Test doubles for the scheduler bridge and clock source: tasks are real OS
//! threads, parking blocks the thread, readying unparks it. This gives the
//! futex paths a faithful "release then park" transition to run against.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use skylark::{ClockId, ClockSource, FutexTable, Scheduler, TaskHandle, TaskId};

struct Waker {
    thread: thread::Thread,
    woken: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct ThreadScheduler {
    state: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_thread: HashMap<thread::ThreadId, TaskHandle>,
    wakers: HashMap<TaskId, Waker>,
    ready_order: Vec<TaskId>,
}

impl ThreadScheduler {
    /// Adopt the calling thread as a task. Must run on each thread before it
    /// touches a futex.
    pub fn register_current(&self) -> TaskHandle {
        let task = TaskHandle::new();
        let mut inner = self.state.lock().unwrap();
        inner.by_thread.insert(thread::current().id(), task.clone());
        inner.wakers.insert(
            task.id(),
            Waker {
                thread: thread::current(),
                woken: Arc::new(AtomicBool::new(false)),
            },
        );
        task
    }

    /// Tasks in the order they were made runnable.
    pub fn ready_order(&self) -> Vec<TaskId> {
        self.state.lock().unwrap().ready_order.clone()
    }
}

impl Scheduler for ThreadScheduler {
    fn current(&self) -> TaskHandle {
        self.state
            .lock()
            .unwrap()
            .by_thread
            .get(&thread::current().id())
            .cloned()
            .expect("calling thread was not registered as a task")
    }

    fn ready_enqueue(&self, task: TaskHandle) {
        let (thread, woken) = {
            let mut inner = self.state.lock().unwrap();
            inner.ready_order.push(task.id());
            let waker = inner.wakers.get(&task.id()).expect("task has no waker");
            (waker.thread.clone(), waker.woken.clone())
        };
        woken.store(true, Ordering::SeqCst);
        thread.unpark();
    }

    fn park_current(&self, release: &mut dyn FnMut()) {
        let woken = {
            let inner = self.state.lock().unwrap();
            let task = inner
                .by_thread
                .get(&thread::current().id())
                .expect("calling thread was not registered as a task");
            inner
                .wakers
                .get(&task.id())
                .expect("task has no waker")
                .woken
                .clone()
        };
        // A wake landing between the release and the park just sets the
        // token, so the park returns immediately; nothing is lost.
        release();
        while !woken.swap(false, Ordering::SeqCst) {
            thread::park();
        }
    }
}

/// Host-backed clock pair.
#[derive(Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now_usec(&self, clock: ClockId) -> u64 {
        match clock {
            ClockId::Monotonic => self.start.elapsed().as_micros() as u64,
            ClockId::Realtime => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("realtime clock before epoch")
                .as_micros() as u64,
        }
    }
}

/// Spin (politely) until the table reports `n` sleepers.
pub fn wait_for_sleepers<S, C>(table: &FutexTable<S, C>, n: usize)
where
    S: Scheduler,
    C: ClockSource,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while table.sleepers() != n {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} sleepers",
            n
        );
        thread::yield_now();
    }
}
