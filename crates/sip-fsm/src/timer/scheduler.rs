use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::timer::{TimerName, TimerProfile};
use crate::transaction::runner::Command;

struct ArmedTimer {
    generation: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    next_generation: u64,
    armed: HashMap<TimerName, ArmedTimer>,
}

/// Named one-shot timers for a single transaction.
///
/// Each armed timer is a tokio task that sleeps and then posts
/// [`Command::Timer`] to the owning transaction's event loop, so timer handling
/// runs on the same loop as message handling. Every arming gets a fresh
/// generation number; [`claim`](Self::claim) rejects firings from timers that
/// were cancelled or re-armed after the command was queued.
pub(crate) struct TimerScheduler {
    profile: TimerProfile,
    sink: mpsc::UnboundedSender<Command>,
    slots: Mutex<Slots>,
}

impl TimerScheduler {
    pub(crate) fn new(profile: TimerProfile, sink: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            profile,
            sink,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Arms `name`, replacing any timer of the same name. Without an override
    /// the profile duration is used. Returns the delay actually armed.
    pub(crate) fn start(&self, name: TimerName, delay: Option<Duration>) -> Duration {
        let delay = delay.unwrap_or_else(|| self.profile.duration(name));
        let sink = self.sink.clone();

        let mut slots = self.slots.lock();
        if let Some(previous) = slots.armed.remove(&name) {
            previous.handle.abort();
        }
        slots.next_generation += 1;
        let generation = slots.next_generation;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink.send(Command::Timer { name, generation });
        });
        slots.armed.insert(
            name,
            ArmedTimer {
                generation,
                delay,
                handle,
            },
        );
        trace!(timer = %name, ?delay, generation, "Timer armed");
        delay
    }

    /// Idempotent. Returns true if a timer was armed.
    pub(crate) fn cancel(&self, name: TimerName) -> bool {
        match self.slots.lock().armed.remove(&name) {
            Some(timer) => {
                timer.handle.abort();
                trace!(timer = %name, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self) {
        let mut slots = self.slots.lock();
        for (_, timer) in slots.armed.drain() {
            timer.handle.abort();
        }
    }

    /// Consumes the armed slot for a firing. Stale generations return false.
    pub(crate) fn claim(&self, name: TimerName, generation: u64) -> bool {
        let mut slots = self.slots.lock();
        let current = slots.armed.get(&name).map(|timer| timer.generation);
        if current != Some(generation) {
            return false;
        }
        slots.armed.remove(&name);
        true
    }

    pub(crate) fn is_armed(&self, name: TimerName) -> bool {
        self.slots.lock().armed.contains_key(&name)
    }

    /// Delay of the currently armed timer of that name.
    pub(crate) fn armed_delay(&self, name: TimerName) -> Option<Duration> {
        self.slots.lock().armed.get(&name).map(|t| t.delay)
    }

    pub(crate) fn armed(&self) -> Vec<TimerName> {
        let mut names: Vec<TimerName> = self.slots.lock().armed.keys().copied().collect();
        names.sort();
        names
    }

    pub(crate) fn profile(&self) -> &TimerProfile {
        &self.profile
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
