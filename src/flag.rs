//! Listenable command-line flags and the process-wide flag registry.
//!
//! A [`ListenerFlag`] resolves to either *bind mode* (`host:port`) or
//! *adopt mode* (`&N`, an inherited descriptor). [`FlagRegistry`] tracks
//! every registered flag in declaration order so the lifecycle operations
//! in [`crate::lifecycle`] can reconstruct a successor's argument vector.

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;

use crate::error::{GracefulError, Result};
use crate::listener::TrackedListener;

/// Fixed network family for a listener flag, set at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Tcp,
    Tcp4,
    Tcp6,
}

/// One of the two modes a [`ListenerFlag`] can hold.
#[derive(Debug, Clone)]
enum Mode {
    Bind(SocketAddr),
    Adopt(RawFd),
}

/// A command-line value that resolves to either "bind this address" or
/// "adopt this inherited descriptor"; activating it via [`Listen`] produces
/// a [`TrackedListener`].
pub struct ListenerFlag {
    name: String,
    family: Family,
    mode: Mutex<Option<Mode>>,
    listener: Mutex<Option<Arc<TrackedListener>>>,
}

impl fmt::Debug for ListenerFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerFlag")
            .field("name", &self.name)
            .field("family", &self.family)
            .finish()
    }
}

impl ListenerFlag {
    pub fn new(name: impl Into<String>, family: Family) -> ListenerFlag {
        ListenerFlag {
            name: name.into(),
            family,
            mode: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse `&N` (decimal non-negative descriptor) into adopt mode, or
    /// resolve anything else as a TCP address in the flag's configured
    /// family, switching to bind mode. Empty input fails.
    pub fn parse(&self, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(GracefulError::ResolveFailure {
                addr: value.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty flag value"),
            });
        }

        let mode = if let Some(digits) = value.strip_prefix('&') {
            let fd: RawFd = digits.parse().map_err(|_| GracefulError::ResolveFailure {
                addr: value.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "adopt descriptor must be a non-negative integer",
                ),
            })?;
            Mode::Adopt(fd)
        } else {
            let addr = resolve(value, self.family).map_err(|source| GracefulError::ResolveFailure {
                addr: value.to_string(),
                source,
            })?;
            Mode::Bind(addr)
        };

        *self.mode.lock().unwrap() = Some(mode);
        Ok(())
    }

    /// Activate the flag: bind a fresh socket or adopt the inherited
    /// descriptor, wrap the result in a [`TrackedListener`], and remember
    /// it for later enumeration. Idempotent-by-construction: call at most
    /// once per flag instance.
    pub async fn listen(&self) -> Result<Arc<TrackedListener>> {
        let mode = self
            .mode
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GracefulError::ResolveFailure {
                addr: self.name.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "listen() called before parse()",
                ),
            })?;

        let tcp = match mode {
            Mode::Bind(addr) => TcpListener::bind(addr)
                .await
                .map_err(|source| GracefulError::ResolveFailure {
                    addr: addr.to_string(),
                    source,
                })?,
            Mode::Adopt(fd) => {
                // SAFETY: the caller asserts `fd` refers to an
                // already-bound, already-listening socket prepared by the
                // parent; a bad descriptor here surfaces as an I/O error
                // on `set_nonblocking`/`TcpListener::from_std` below,
                // which we turn into `AdoptFailure`.
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                std_listener
                    .set_nonblocking(true)
                    .map_err(|source| GracefulError::AdoptFailure { fd, source })?;
                TcpListener::from_std(std_listener)
                    .map_err(|source| GracefulError::AdoptFailure { fd, source })?
            }
        };

        let tracked = Arc::new(TrackedListener::new(tcp));
        *self.listener.lock().unwrap() = Some(Arc::clone(&tracked));
        Ok(tracked)
    }

    /// The tracked listener this flag produced, if `listen()` has run.
    pub fn tracked_listener(&self) -> Option<Arc<TrackedListener>> {
        self.listener.lock().unwrap().clone()
    }

    /// The current string value: the bind address in bind mode (whether or
    /// not `listen()` has run yet), or `&N` in adopt mode.
    pub fn string(&self) -> String {
        match &*self.mode.lock().unwrap() {
            Some(Mode::Bind(addr)) => addr.to_string(),
            Some(Mode::Adopt(fd)) => format!("&{fd}"),
            None => String::new(),
        }
    }
}

fn resolve(value: &str, family: Family) -> std::io::Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    let candidates: Vec<SocketAddr> = value.to_socket_addrs()?.collect();
    let chosen = match family {
        Family::Tcp => candidates.into_iter().next(),
        Family::Tcp4 => candidates.into_iter().find(|a| a.is_ipv4()),
        Family::Tcp6 => candidates.into_iter().find(|a| a.is_ipv6()),
    };
    chosen.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no address for {value} in the requested family"),
        )
    })
}

/// A non-listener flag: just a name and a current string value, re-emitted
/// verbatim in the successor's argument vector.
pub trait PlainFlag: Send + Sync {
    fn name(&self) -> &str;
    fn value(&self) -> String;
}

enum Entry {
    Listener(Arc<ListenerFlag>),
    Plain(Box<dyn PlainFlag>),
}

/// The process-wide set of command-line flags, enumerable in registration
/// order. The lifecycle operations read this registry to reconstruct the
/// successor's argument vector.
#[derive(Default)]
pub struct FlagRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl FlagRegistry {
    pub fn new() -> FlagRegistry {
        FlagRegistry::default()
    }

    pub fn register_listener(&self, flag: Arc<ListenerFlag>) {
        self.entries.lock().unwrap().push(Entry::Listener(flag));
    }

    pub fn register_plain(&self, flag: Box<dyn PlainFlag>) {
        self.entries.lock().unwrap().push(Entry::Plain(flag));
    }

    /// All listener flags that have produced a tracked listener, in
    /// registration order.
    pub fn live_listeners(&self) -> Vec<Arc<ListenerFlag>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Entry::Listener(f) if f.tracked_listener().is_some() => Some(Arc::clone(f)),
                _ => None,
            })
            .collect()
    }

    /// Re-emit every registered flag as `--name=value`, in registration
    /// order, for the successor's argument vector. Listener flags with a
    /// live tracked listener must have already been switched to adopt
    /// mode (by `Restart`) before this is called.
    pub fn to_argv(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                Entry::Listener(f) => format!("--{}={}", f.name(), f.string()),
                Entry::Plain(f) => format!("--{}={}", f.name(), f.value()),
            })
            .collect()
    }
}

impl fmt::Debug for FlagRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagRegistry")
            .field("len", &self.entries.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bind_mode() {
        let flag = ListenerFlag::new("listen", Family::Tcp);
        flag.parse("127.0.0.1:0").unwrap();
        assert!(flag.string().starts_with("127.0.0.1:"));
    }

    #[test]
    fn parse_adopt_mode() {
        let flag = ListenerFlag::new("listen", Family::Tcp);
        flag.parse("&7").unwrap();
        assert_eq!(flag.string(), "&7");
    }

    #[test]
    fn parse_empty_fails() {
        let flag = ListenerFlag::new("listen", Family::Tcp);
        assert!(flag.parse("").is_err());
    }

    #[tokio::test]
    async fn listen_in_bind_mode_produces_tracked_listener() {
        let flag = ListenerFlag::new("listen", Family::Tcp);
        flag.parse("127.0.0.1:0").unwrap();
        let tracked = flag.listen().await.unwrap();
        assert!(tracked.addr().is_ok());
        assert!(flag.tracked_listener().is_some());
    }

    #[test]
    fn registry_preserves_registration_order() {
        struct Plain(&'static str, &'static str);
        impl PlainFlag for Plain {
            fn name(&self) -> &str {
                self.0
            }
            fn value(&self) -> String {
                self.1.to_string()
            }
        }

        let registry = FlagRegistry::new();
        let a = Arc::new(ListenerFlag::new("listen", Family::Tcp));
        a.parse("127.0.0.1:9000").unwrap();
        registry.register_listener(Arc::clone(&a));
        registry.register_plain(Box::new(Plain("loglevel", "2")));

        let argv = registry.to_argv();
        assert_eq!(argv, vec!["--listen=127.0.0.1:9000", "--loglevel=2"]);
    }
}
