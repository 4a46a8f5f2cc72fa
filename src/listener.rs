//! Tracked listener: a `TcpListener` wrapper that counts live connections
//! and can be stopped out from under a blocked `accept`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::{GracefulError, Result};

#[derive(Debug)]
struct Shared {
    counter: AtomicUsize,
    notify_drained: tokio::sync::Notify,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the counter and wakes any `Wait()` callers if it reached
    /// zero. Safe to call more than the matching number of increments would
    /// suggest only via `TrackedConnection::Drop`'s `close_once` guard.
    fn decrement(&self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify_drained.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

/// A stream-accepting socket wrapper with live-connection counting and a
/// broadcastable stop signal.
pub struct TrackedListener {
    listener: TcpListener,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
    closed: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for TrackedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("live_connections", &self.shared.count())
            .finish()
    }
}

impl TrackedListener {
    pub fn new(listener: TcpListener) -> TrackedListener {
        let (stop_tx, stop_rx) = watch::channel(false);
        TrackedListener {
            listener,
            shared: Arc::new(Shared {
                counter: AtomicUsize::new(0),
                notify_drained: tokio::sync::Notify::new(),
                stop_tx,
            }),
            stop_rx,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Accept a connection. Counter discipline (race-critical): the
    /// counter is incremented *before* the underlying accept returns, so a
    /// racing `Wait()` observing "counter == 0" cannot miss an in-flight
    /// acceptance; any path that doesn't yield a connection decrements it
    /// back.
    pub async fn accept(&self) -> Result<TrackedConnection> {
        self.shared.increment();

        if self.is_stopped() {
            self.shared.decrement();
            return Err(GracefulError::Stopped);
        }

        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            biased;
            _ = wait_for_stop(&mut stop_rx) => {
                self.shared.decrement();
                Err(GracefulError::Stopped)
            }
            res = self.listener.accept() => {
                match res {
                    Ok((stream, _addr)) => Ok(TrackedConnection::new(stream, Arc::clone(&self.shared))),
                    Err(err) => {
                        self.shared.decrement();
                        if self.is_stopped() || is_closed_indication(&err) {
                            Err(GracefulError::Stopped)
                        } else {
                            Err(GracefulError::Io(err))
                        }
                    }
                }
            }
        }
    }

    /// Raise the stop signal and close the underlying acceptor. May be
    /// invoked at most once.
    pub fn close(&self) -> Result<()> {
        self.stop()?;
        // Dropping the underlying `TcpListener`'s fd happens when the
        // whole `TrackedListener` is dropped; `Close` additionally shuts
        // the raw fd down immediately so pending local `accept`s observe
        // a closed socket rather than merely a raised flag.
        let _ = nix::sys::socket::shutdown(self.listener.as_raw_fd(), nix::sys::socket::Shutdown::Both);
        Ok(())
    }

    /// Raise the stop signal but leave the acceptor's descriptor open, so
    /// it remains valid for inheritance by a successor.
    pub fn stop(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GracefulError::AlreadyStopped);
        }
        let _ = self.shared.stop_tx.send(true);
        Ok(())
    }

    /// Blocks until the live-connection counter is zero. Does not itself
    /// stop accepting; the caller must have raised the stop signal.
    ///
    /// Registers interest on the drain notification *before* checking the
    /// counter (via `enable()`), so a decrement racing with the check
    /// can't be missed between "counter is still nonzero" and "start
    /// waiting": `Notify::notify_waiters` only wakes waiters already
    /// registered at the time it's called.
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.notify_drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Duplicate the underlying listening socket's fd at the OS level.
    /// The new descriptor is not close-on-exec and is intended to be
    /// inherited by a successor process.
    pub fn dup(&self) -> Result<RawFd> {
        let raw = self.listener.as_raw_fd();
        nix::unistd::dup(raw).map_err(|e| GracefulError::DupFailure {
            fd: raw,
            source: io::Error::from_raw_os_error(e as i32),
        })
    }

    /// Dial a dummy connection to this listener's own address to wake a
    /// thread blocked in `accept` after `Stop`. Tries IPv4 loopback, then
    /// IPv6 loopback, then the listener's advertised address; the first
    /// successful dial suffices. All three failing is logged but not
    /// fatal: the accept may already be unblocked by other means.
    pub async fn wake_blocked_accept(&self) {
        let port = match self.addr() {
            Ok(addr) => addr.port(),
            Err(_) => return,
        };

        let candidates = [
            SocketAddr::from(([127, 0, 0, 1], port)),
            SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], port)),
        ];

        for candidate in candidates {
            if TcpStream::connect(candidate).await.is_ok() {
                return;
            }
        }

        if let Ok(addr) = self.addr() {
            if TcpStream::connect(addr).await.is_ok() {
                return;
            }
        }

        tracing::warn!("dummy-dial wake failed on all candidate addresses");
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    // `changed()` resolves once the stop flag flips to `true`; a
    // receiver created after the flip would otherwise wait forever, but
    // callers only construct this future while `!is_stopped()` held at
    // selection time, so the transition is still pending.
    let _ = rx.changed().await;
}

/// Platform-dependent substring match for "this socket was closed" errors,
/// used when the OS doesn't give us a clean stopped/not-stopped signal.
/// This is a known design smell: a reimplementation should prefer a
/// typed/errno-level check where the platform offers one.
fn is_closed_indication(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    ) || err.to_string().contains("closed")
        || err.raw_os_error() == Some(libc::EBADF)
}

/// An accepted connection that decrements the listener's live-connection
/// counter exactly once on close (including drop).
pub struct TrackedConnection {
    stream: TcpStream,
    shared: Arc<Shared>,
    closed: std::sync::atomic::AtomicBool,
}

impl TrackedConnection {
    fn new(stream: TcpStream, shared: Arc<Shared>) -> TrackedConnection {
        TrackedConnection {
            stream,
            shared,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn close_once(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.decrement();
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.close_once();
    }
}

impl AsyncRead for TrackedConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    async fn bind_loopback() -> TrackedListener {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        TrackedListener::new(listener)
    }

    #[tokio::test]
    async fn accept_after_stop_returns_stopped_sentinel() {
        let listener = bind_loopback().await;
        let addr = listener.addr().unwrap();

        listener.stop().unwrap();

        let dial = tokio::spawn(async move {
            let _ = TcpStream::connect(addr).await;
        });

        let res = listener.accept().await;
        assert!(matches!(res, Err(GracefulError::Stopped)));
        let _ = dial.await;
    }

    #[tokio::test]
    async fn wait_resolves_once_all_connections_close() {
        let listener = bind_loopback().await;
        let addr = listener.addr().unwrap();

        let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let conn = listener.accept().await.unwrap();
        let client = dialer.await.unwrap();

        listener.stop().unwrap();

        let wait_fut = listener.wait();
        tokio::pin!(wait_fut);
        assert!(futures_now_pending(&mut wait_fut));

        drop(conn);
        drop(client);

        wait_fut.await;
    }

    fn futures_now_pending<F: std::future::Future + Unpin>(f: &mut F) -> bool {
        use std::task::{RawWaker, RawWakerVTable, Waker};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        matches!(Pin::new(f).poll(&mut cx), Poll::Pending)
    }

    #[tokio::test]
    async fn second_stop_is_an_error() {
        let listener = bind_loopback().await;
        listener.stop().unwrap();
        assert!(matches!(listener.stop(), Err(GracefulError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn dup_leaves_original_usable() {
        let listener = bind_loopback().await;
        let addr = listener.addr().unwrap();
        let dup_fd = listener.dup().unwrap();
        assert!(dup_fd >= 0);

        let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let conn = listener.accept().await;
        assert!(conn.is_ok());
        let _ = dialer.await;

        unsafe {
            libc::close(dup_fd);
        }
    }
}
