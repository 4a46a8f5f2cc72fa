//! Signal controller: the long-lived loop that translates platform
//! signals into lifecycle operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::lifecycle::Lifecycle;
use crate::log::{Level, Sink};

/// Signal channel capacity. Overflow is dropped by the OS
/// delivery mechanism, not buffered further here.
const SIGNAL_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Shutdown,
    Restart,
    StackDump,
    Unknown(i32),
}

fn classify(kind: RawSignal) -> Category {
    match kind {
        RawSignal::Int | RawSignal::Term => Category::Shutdown,
        RawSignal::Hup => Category::Restart,
        RawSignal::Usr1 => Category::StackDump,
        RawSignal::Other(n) => Category::Unknown(n),
    }
}

#[derive(Debug, Clone, Copy)]
enum RawSignal {
    Int,
    Term,
    Hup,
    Usr1,
    Other(i32),
}

/// The signal-driven controller: `SIGINT`/`SIGTERM` shut down, `SIGHUP`
/// restarts, `SIGUSR1` dumps the stack, and anything else is logged and
/// ignored. A second terminating signal while a lifecycle operation is
/// in flight is fatal.
pub struct SignalController {
    lifecycle: Arc<Lifecycle>,
    sink: Arc<Sink>,
    lame_duck: Duration,
}

impl SignalController {
    pub fn new(lifecycle: Arc<Lifecycle>, sink: Arc<Sink>) -> SignalController {
        SignalController {
            lifecycle,
            sink,
            lame_duck: crate::lifecycle::DEFAULT_LAME_DUCK,
        }
    }

    pub fn with_lame_duck(mut self, lame_duck: Duration) -> SignalController {
        self.lame_duck = lame_duck;
        self
    }

    /// Blocks forever, driving the process through shutdown or restart on
    /// the first terminating signal. Never returns normally: every path
    /// out of a lifecycle operation calls `std::process::exit`.
    pub async fn run(self) -> ! {
        let (tx, mut rx) = mpsc::channel::<RawSignal>(SIGNAL_CHANNEL_CAPACITY);

        spawn_forwarder(tx.clone(), SignalKind::interrupt(), RawSignal::Int);
        spawn_forwarder(tx.clone(), SignalKind::terminate(), RawSignal::Term);
        spawn_forwarder(tx.clone(), SignalKind::hangup(), RawSignal::Hup);
        spawn_forwarder(tx, SignalKind::user_defined1(), RawSignal::Usr1);

        loop {
            let Some(raw) = rx.recv().await else {
                // All forwarders died; nothing left to drive the loop.
                crate::printf!(self.sink, Level::FATAL, "signal channel closed unexpectedly");
                unreachable!("Fatal printf exits the process");
            };

            match classify(raw) {
                Category::Shutdown => {
                    self.run_operation("Shutdown", &mut rx, Op::Shutdown).await;
                }
                Category::Restart => {
                    self.run_operation("Restart", &mut rx, Op::Restart).await;
                }
                Category::StackDump => {
                    crate::printf!(
                        self.sink,
                        Level::verbose(4),
                        "stack dump requested by signal controller:\n{}",
                        self.sink.stack()
                    );
                }
                Category::Unknown(n) => {
                    crate::printf!(self.sink, Level::WARNING, "unknown signal {n}");
                }
            }
        }
    }

    /// Spawns the lifecycle operation in the background,
    /// then blocks for follow-up signals for as long as the process lives.
    /// There is no recovery from `InOperation` back to `Idle`: a second
    /// terminating signal is fatal, and anything else (stack dump,
    /// unknown) is logged and the wait continues; it never falls back to
    /// the outer loop, which would let a *third* shutdown/restart request
    /// spawn a second lifecycle operation on top of the first.
    async fn run_operation(&self, op: &'static str, rx: &mut mpsc::Receiver<RawSignal>, kind: Op) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let lame_duck = self.lame_duck;
        tokio::spawn(async move {
            match kind {
                Op::Shutdown => lifecycle.shutdown(lame_duck).await,
                Op::Restart => lifecycle.restart(lame_duck).await,
            }
        });

        loop {
            let Some(next) = rx.recv().await else {
                crate::printf!(self.sink, Level::FATAL, "signal channel closed during {op}");
                unreachable!("Fatal printf exits the process");
            };

            match classify(next) {
                Category::Shutdown | Category::Restart => {
                    crate::error::GracefulError::SecondSignal { op }.report_and_exit(&self.sink);
                }
                Category::StackDump => {
                    crate::printf!(
                        self.sink,
                        Level::verbose(4),
                        "stack dump requested during {op}:\n{}",
                        self.sink.stack()
                    );
                }
                Category::Unknown(n) => {
                    crate::printf!(self.sink, Level::WARNING, "unknown signal {n} during {op}");
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Shutdown,
    Restart,
}

fn spawn_forwarder(tx: mpsc::Sender<RawSignal>, kind: SignalKind, tag: RawSignal) {
    tokio::spawn(async move {
        let Ok(mut stream) = signal(kind) else {
            return;
        };
        while stream.recv().await.is_some() {
            // A full channel means overflow; drop the signal rather than
            // block, matching the OS's own overflow-drops-further-delivery
            // behavior for repeated signals.
            match tx.try_send(tag) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_terminating_signals_as_shutdown() {
        assert_eq!(classify(RawSignal::Int), Category::Shutdown);
        assert_eq!(classify(RawSignal::Term), Category::Shutdown);
    }

    #[test]
    fn classifies_hangup_as_restart() {
        assert_eq!(classify(RawSignal::Hup), Category::Restart);
    }

    #[test]
    fn classifies_usr1_as_stack_dump() {
        assert_eq!(classify(RawSignal::Usr1), Category::StackDump);
    }

    #[test]
    fn classifies_unrecognized_signal_numbers_as_unknown() {
        assert_eq!(classify(RawSignal::Other(31)), Category::Unknown(31));
    }

    #[tokio::test]
    #[should_panic(expected = "would exit with code 1")]
    async fn second_signal_mid_operation_is_fatal() {
        use crate::flag::FlagRegistry;
        use crate::log::test_support::RecordingExit;

        let sink = Arc::new(Sink::with_exit_action(Box::new(RecordingExit::new())));
        let registry = Arc::new(FlagRegistry::new());
        let lifecycle = Arc::new(Lifecycle::new(registry, Arc::clone(&sink)));
        let controller = SignalController::new(lifecycle, sink);

        let (tx, mut rx) = mpsc::channel::<RawSignal>(SIGNAL_CHANNEL_CAPACITY);
        // Queued before entering run_operation, so the first rx.recv() in
        // its wait loop observes it as the second terminating signal.
        tx.try_send(RawSignal::Term).unwrap();

        controller.run_operation("Shutdown", &mut rx, Op::Shutdown).await;
    }
}
