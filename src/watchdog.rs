/// Per-tick health hook.
///
/// The control loop calls `check` once at the end of every tick, after any
/// remote-driven switch. The rig ships with `NoopWatchdog`; a real policy
/// (hashrate floor, stale output, temperature) plugs in here.
use crate::catalog::MinerDescriptor;

pub trait Watchdog: Send + Sync {
    fn check(&self, tick: u64, active: Option<&MinerDescriptor>);
}

/// Does nothing.
#[derive(Debug, Default)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn check(&self, tick: u64, _active: Option<&MinerDescriptor>) {
        tracing::trace!(tick, "watchdog check");
    }
}
