//! Page latch: a short-duration reader/writer lock with writer preference.
//!
//! Unlike `parking_lot::RwLock`, the latch is not tied to a guard's lifetime.
//! Callers (mostly the page guards in `storage::buffer`) acquire and release
//! it explicitly, which is what allows `downgrade` and an `unlock` that works
//! out for itself whether it is releasing a read or a write hold.
//!
//! Misuse is a programming error: unlocking an unheld latch or downgrading
//! without a write hold panics in every build.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

/// Multi-reader/single-writer latch.
///
/// Once a writer is waiting, new readers queue behind it.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared hold, blocking while a writer holds or waits for the latch.
    pub fn read_lock(&self) {
        let mut state = self.state.lock();
        while state.writer || state.waiting_writers > 0 {
            self.readers_cv.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Acquire the exclusive hold.
    pub fn write_lock(&self) {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            self.writers_cv.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    /// Non-blocking shared acquisition. Fails if a writer holds or waits.
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.waiting_writers > 0 {
            return false;
        }
        state.readers += 1;
        true
    }

    /// Non-blocking exclusive acquisition. Fails if any holder exists.
    pub fn try_write_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    /// Release the caller's hold, read or write.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        if state.writer {
            state.writer = false;
        } else if state.readers > 0 {
            state.readers -= 1;
        } else {
            panic!("latch: unlock of an unheld latch");
        }
        self.wake(&state);
    }

    /// Turn the caller's write hold into a read hold with no unlocked window.
    pub fn downgrade(&self) {
        let mut state = self.state.lock();
        assert!(state.writer, "latch: downgrade without a write hold");
        state.writer = false;
        state.readers = 1;
        if state.waiting_writers == 0 {
            self.readers_cv.notify_all();
        }
    }

    pub fn assert_locked(&self) {
        let state = self.state.lock();
        assert!(
            state.writer || state.readers > 0,
            "latch: expected the latch to be held"
        );
    }

    pub fn assert_write_locked(&self) {
        assert!(self.state.lock().writer, "latch: expected a write hold");
    }

    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer || state.readers > 0
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    pub fn reader_count(&self) -> u32 {
        self.state.lock().readers
    }

    pub fn has_waiting_writers(&self) -> bool {
        self.state.lock().waiting_writers > 0
    }

    fn wake(&self, state: &LatchState) {
        if state.waiting_writers > 0 {
            if state.readers == 0 {
                self.writers_cv.notify_one();
            }
        } else {
            self.readers_cv.notify_all();
        }
    }
}
