use std::path::PathBuf;

use thiserror::Error;

/// The distinguished error kinds the substrate can produce.
///
/// Each variant corresponds to one row in the error-kind table: some are
/// recovered locally by callers (`Stopped`, `UnknownSignal`), the rest are
/// meant to be logged at `Fatal` and terminate the process.
#[derive(Debug, Error)]
pub enum GracefulError {
    /// Accept on a listener whose stop signal has been raised.
    #[error("listener stopped")]
    Stopped,

    /// Invalid bind address at flag parse time.
    #[error("cannot resolve bind address {addr:?}: {source}")]
    ResolveFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Inherited descriptor cannot be made into a listener.
    #[error("cannot adopt inherited descriptor {fd}: {source}")]
    AdoptFailure {
        fd: i32,
        #[source]
        source: std::io::Error,
    },

    /// OS refuses to duplicate a descriptor.
    #[error("cannot duplicate descriptor {fd}: {source}")]
    DupFailure {
        fd: i32,
        #[source]
        source: std::io::Error,
    },

    /// Exec of the successor failed.
    #[error("failed to spawn successor {path:?}: {source}")]
    SpawnFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Lifecycle drain exceeded its deadline.
    #[error("{op} timed out after {elapsed_secs}s")]
    Timeout { op: &'static str, elapsed_secs: u64 },

    /// A second terminating signal arrived mid-operation.
    #[error("{op} aborted by second signal")]
    SecondSignal { op: &'static str },

    /// A signal arrived with no mapped category.
    #[error("unknown signal {signal}")]
    UnknownSignal { signal: i32 },

    /// `Close`/`Stop` invoked a second time on the same listener.
    #[error("listener already stopped")]
    AlreadyStopped,

    /// The underlying acceptor returned an error unrelated to the stop
    /// signal; propagated verbatim.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GracefulError {
    /// Errors that indicate a broken invariant or an unrecoverable
    /// operational failure: logged at `Fatal`, which exits the process.
    ///
    /// `Stopped` and `UnknownSignal` are recovered locally by their callers
    /// and never reach this check in practice, but are classified here too
    /// for completeness of the policy table.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            GracefulError::Stopped | GracefulError::UnknownSignal { .. }
        )
    }

    /// Logs this error through `sink` and terminates the process. Fatal
    /// kinds get a `Fatal` record (stack dump included); the rest get a
    /// plain `Error` record before exiting anyway, since every caller of
    /// this method sits on a lifecycle path with no way back to normal
    /// operation.
    pub fn report_and_exit(&self, sink: &crate::log::Sink) -> ! {
        if self.is_fatal() {
            crate::printf!(sink, crate::log::Level::FATAL, "{self}");
            unreachable!("Fatal printf exits the process");
        }
        crate::printf!(sink, crate::log::Level::ERROR, "{self}");
        sink.exit(1);
    }
}

pub type Result<T> = std::result::Result<T, GracefulError>;
