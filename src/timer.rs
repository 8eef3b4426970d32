//
// Copyright 2025 Jeff Bush
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//
// Deferred work timers.
// Timers are armed and cancelled constantly: every data segment TCP sends
// or receives touches the retransmit or delayed-ack timer. The owner embeds
// a NetTimer handle in its own structure; this module only links pending
// callbacks into one global time-ordered queue, serviced by a single worker
// thread. Callbacks therefore run on the worker thread, never on the arming
// thread, and a callback that needs its target object alive must own a
// strong reference to it (the TCP code clones an Arc into every closure it
// arms).
//

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, LazyLock, Mutex};
use std::time::{Duration, Instant};

// Upper bound on how long the worker sleeps without rechecking the queue.
const MAX_SLEEP: Duration = Duration::from_millis(100);

/// An inert handle identifying one timer. Arming links it into the queue;
/// a handle is queued at most once, and re-arming an already-queued handle
/// moves it rather than duplicating it.
pub struct NetTimer {
    token: u64,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl NetTimer {
    pub fn new() -> NetTimer {
        NetTimer {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for NetTimer {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingTimer {
    deadline: Instant,
    token: u64,
    callback: Box<dyn FnOnce() + Send>,
}

struct TimerQueue {
    pending: Mutex<Vec<PendingTimer>>,
    signal: Condvar,
}

static TIMER_QUEUE: LazyLock<TimerQueue> = LazyLock::new(|| TimerQueue {
    pending: Mutex::new(Vec::new()),
    signal: Condvar::new(),
});

fn unlink(pending: &mut Vec<PendingTimer>, token: u64) -> bool {
    match pending.iter().position(|entry| entry.token == token) {
        Some(index) => {
            pending.remove(index);
            true
        }
        None => false,
    }
}

/// Schedule `callback` to run on the timer thread after `delay`. If the
/// timer is already queued this re-arms it (the old callback is dropped
/// unrun). Returns true if the timer was newly queued, false on a re-arm;
/// owners that pair each queued timer with a resource hold key off this.
pub fn arm<F>(timer: &NetTimer, delay: Duration, callback: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let mut pending = TIMER_QUEUE.pending.lock().unwrap();
    let was_queued = unlink(&mut pending, timer.token);

    let deadline = Instant::now() + delay;

    // Equal deadlines keep arming order.
    let index = pending.partition_point(|entry| entry.deadline <= deadline);
    pending.insert(
        index,
        PendingTimer {
            deadline,
            token: timer.token,
            callback: Box::new(callback),
        },
    );

    drop(pending);
    TIMER_QUEUE.signal.notify_one();

    !was_queued
}

/// Unlink a timer, dropping its callback unrun. Returns whether it was
/// queued.
pub fn cancel(timer: &NetTimer) -> bool {
    let mut pending = TIMER_QUEUE.pending.lock().unwrap();
    unlink(&mut pending, timer.token)
}

fn timer_thread() {
    let mut pending = TIMER_QUEUE.pending.lock().unwrap();
    loop {
        let now = Instant::now();
        while !pending.is_empty() && pending[0].deadline <= now {
            let entry = pending.remove(0);

            // Unlock while the callback runs: callbacks routinely re-arm
            // timers, which takes this lock.
            drop(pending);
            (entry.callback)();
            pending = TIMER_QUEUE.pending.lock().unwrap();
        }

        let sleep = match pending.first() {
            Some(entry) => std::cmp::min(
                entry.deadline.saturating_duration_since(Instant::now()),
                MAX_SLEEP,
            ),
            None => MAX_SLEEP,
        };

        pending = TIMER_QUEUE.signal.wait_timeout(pending, sleep).unwrap().0;
    }
}

pub fn init() {
    std::thread::spawn(timer_thread);
}
