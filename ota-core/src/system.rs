// System control collaborator: the three ways the core hands control back
// to the platform. On real hardware `restart` and `idle_until_reset` never
// return; host fakes record the call and do return, which is what lets the
// tests observe them.

use std::time::Duration;

pub trait SystemControl {
    /// Blocking sleep; the orchestrator's idle pacing goes through here.
    fn sleep(&self, duration: Duration);

    /// Full device restart. The only successful exit of an update attempt.
    fn restart(&self);

    /// Park passively until the operator resets the device. Used when an
    /// offered image is rejected by policy: not an error, but nothing left
    /// to do either.
    fn idle_until_reset(&self);
}
