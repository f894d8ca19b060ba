// Signal set shared by the trigger source, the connectivity monitor and the
// orchestrator. Flags are level-triggered: they stay asserted until the
// consumer explicitly clears them, and repeated assertions collapse into one
// observation.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bitmask over the agent's signal flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signals(u32);

impl Signals {
    pub const NONE: Signals = Signals(0);
    /// Network association is up and an address has been acquired.
    pub const CONNECTED: Signals = Signals(1 << 0);
    /// Network association dropped.
    pub const DISCONNECTED: Signals = Signals(1 << 1);
    /// The physical trigger fired; one update attempt is due.
    pub const UPDATE_REQUESTED: Signals = Signals(1 << 4);
    /// The orchestrator reached its steady application loop.
    pub const NORMAL_OPERATION: Signals = Signals(1 << 6);

    pub fn contains(self, other: Signals) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Signals) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for Signals {
    type Output = Signals;

    fn bitor(self, rhs: Signals) -> Signals {
        Signals(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for Signals {
    fn bitor_assign(&mut self, rhs: Signals) {
        self.0 |= rhs.0;
    }
}

/// Fixed collection of independently settable/clearable flags with blocking
/// wait-for-any semantics.
///
/// Created once at startup and injected (`Arc<SignalSet>`) into every task
/// that publishes or consumes signals.
pub struct SignalSet {
    flags: Mutex<u32>,
    changed: Condvar,
}

impl SignalSet {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub fn set(&self, signals: Signals) {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        *flags |= signals.0;
        self.changed.notify_all();
    }

    pub fn clear(&self, signals: Signals) {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        *flags &= !signals.0;
        self.changed.notify_all();
    }

    pub fn snapshot(&self) -> Signals {
        Signals(*self.flags.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Block until any flag in `mask` is asserted, or until `timeout` elapses
    /// if one is given. Returns a snapshot of all flags at wake-up time; the
    /// flags are NOT cleared by waiting.
    pub fn wait_any(&self, mask: Signals, timeout: Option<Duration>) -> Signals {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let current = Signals(*flags);
            if current.intersects(mask) {
                return current;
            }
            match deadline {
                None => {
                    flags = self
                        .changed
                        .wait(flags)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return current;
                    }
                    let (guard, _) = self
                        .changed
                        .wait_timeout(flags, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    flags = guard;
                }
            }
        }
    }
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_and_snapshot() {
        let set = SignalSet::new();
        set.set(Signals::CONNECTED | Signals::UPDATE_REQUESTED);
        let snap = set.snapshot();
        assert!(snap.contains(Signals::CONNECTED));
        assert!(snap.contains(Signals::UPDATE_REQUESTED));
        assert!(!snap.contains(Signals::DISCONNECTED));
    }

    #[test]
    fn clear_removes_only_named_flags() {
        let set = SignalSet::new();
        set.set(Signals::CONNECTED | Signals::NORMAL_OPERATION);
        set.clear(Signals::NORMAL_OPERATION);
        assert_eq!(set.snapshot(), Signals::CONNECTED);
    }

    #[test]
    fn wait_any_returns_immediately_when_already_asserted() {
        let set = SignalSet::new();
        set.set(Signals::DISCONNECTED);
        let observed = set.wait_any(Signals::CONNECTED | Signals::DISCONNECTED, None);
        assert!(observed.contains(Signals::DISCONNECTED));
    }

    #[test]
    fn wait_any_times_out_with_nothing_asserted() {
        let set = SignalSet::new();
        let observed = set.wait_any(Signals::CONNECTED, Some(Duration::from_millis(20)));
        assert!(observed.is_empty());
    }

    #[test]
    fn wait_any_wakes_on_cross_thread_set() {
        let set = Arc::new(SignalSet::new());
        let publisher = set.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.set(Signals::CONNECTED);
        });
        let observed = set.wait_any(Signals::CONNECTED, None);
        assert!(observed.contains(Signals::CONNECTED));
        handle.join().expect("publisher thread panicked");
    }

    #[test]
    fn repeated_assertions_collapse_to_one_observation() {
        let set = SignalSet::new();
        set.set(Signals::UPDATE_REQUESTED);
        set.set(Signals::UPDATE_REQUESTED);
        assert!(set.snapshot().contains(Signals::UPDATE_REQUESTED));
        set.clear(Signals::UPDATE_REQUESTED);
        assert!(!set.snapshot().contains(Signals::UPDATE_REQUESTED));
    }
}
