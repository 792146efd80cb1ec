/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both request shutdown; the rig then stops its
/// control loop and kills the miner before exiting. Miners run in their own
/// process group, so a terminal Ctrl-C reaches only the rig.
use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalHandler {
    /// Register the handlers. Do this before starting any miner.
    pub fn install() -> std::io::Result<SignalHandler> {
        Ok(SignalHandler {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown request; returns the signal name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}
