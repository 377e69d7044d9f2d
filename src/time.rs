//! Collaborator contract the embedding kernel satisfies: global state is
//! a process-global handle passed explicitly, not an implicit ambient.
//! This crate never reads a wall clock or spawns an OS thread itself; every
//! timer is measured in monotonic milliseconds supplied by
//! [`Clock::now_ms`], and every daemon is driven by the kernel calling
//! `tick()` on its own cadence.

/// Monotonic millisecond clock, analogous to a kernel scheduler's
/// `get_time` primitive.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// A `Clock` is also the thing daemons ask "how long has it been," so a
/// small helper for elapsed-time checks lives here rather than being
/// re-derived in every timer.
pub fn elapsed_ms(clock: &dyn Clock, since_ms: u64) -> u64 {
    clock.now_ms().saturating_sub(since_ms)
}

/// Cooperative task creation, matching a kernel scheduler that supplies
/// `msleep`, `get_time`, and task creation. The embedding kernel implements
/// this; this crate's daemons (`daemon.rs`) are plain structs with a `tick`
/// method the scheduler calls at its own suspension points, so no blocking
/// `msleep` call is made from within this crate.
pub trait Scheduler {
    /// Spawn a named long-lived task. The closure is expected to loop,
    /// sleeping between iterations at the daemon's tick interval.
    fn spawn_daemon(&self, name: &'static str, f: alloc::boxed::Box<dyn FnMut() + Send>);
}
