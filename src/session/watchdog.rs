//! Watchdog generation gate
//!
//! The watchdog is one self-rescheduling task per generation. A pass is valid
//! only while its generation is the current one; restarting the watchdog
//! bumps the generation so a superseded task exits on its next check instead
//! of being aborted mid-pass.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;

#[derive(Default)]
struct GateState {
    generation: u64,
    running: bool,
    handle: Option<JoinHandle<()>>,
    shut_down: bool,
}

/// Generation token gate of the watchdog loop
#[derive(Default)]
pub struct Watchdog {
    state: Mutex<GateState>,
    tick: tokio::sync::Mutex<()>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a new generation if no loop is running
    ///
    /// Returns `None` while a loop is live or after shutdown, so attaching
    /// several consumers never starts several loops.
    pub fn arm(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.running || state.shut_down {
            return None;
        }
        state.generation += 1;
        state.running = true;
        Some(state.generation)
    }

    /// Remember the task of `generation` so shutdown can abort it
    pub fn set_handle(&self, generation: u64, handle: JoinHandle<()>) {
        let mut state = self.state.lock();
        if state.running && state.generation == generation {
            state.handle = Some(handle);
        } else {
            handle.abort();
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.running && state.generation == generation
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Invalidate the running generation; its task exits on its next check
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.running = false;
        state.handle = None;
    }

    /// Invalidate and abort; no generation can be armed afterwards
    pub fn shutdown(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.running = false;
            state.shut_down = true;
            state.handle.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Serialises passes so a stale pass never overlaps the current one
    pub async fn lock_tick(&self) -> MutexGuard<'_, ()> {
        self.tick.lock().await
    }
}

/// Delay until the next pass
///
/// The earlier of the next whole second (measured from `since_epoch`, the
/// time elapsed since a second-aligned epoch) and the remaining deadline,
/// never below `floor`.
pub fn next_delay(since_epoch: Duration, remaining: Option<Duration>, floor: Duration) -> Duration {
    let into_second = (since_epoch.as_millis() % 1000) as u64;
    let to_second = Duration::from_millis(1000 - into_second);
    let delay = match remaining {
        Some(remaining) => remaining.min(to_second),
        None => to_second,
    };
    delay.max(floor)
}
