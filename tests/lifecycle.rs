//! Integration-level lifecycle scenarios, exercised directly against
//! `TrackedListener`/`ListenerFlag` rather than through a spawned process
//! (the `Lifecycle::shutdown`/`restart` methods themselves call
//! `std::process::exit`, which integration tests can't safely drive).

use std::sync::Arc;
use std::time::Duration;

use graceful::{Family, FlagRegistry, GracefulError, ListenerFlag};
use tokio::net::TcpStream;

async fn bind(registry: &FlagRegistry) -> (Arc<ListenerFlag>, Arc<graceful::TrackedListener>) {
    let flag = Arc::new(ListenerFlag::new("listen", Family::Tcp));
    flag.parse("127.0.0.1:0").unwrap();
    let tracked = flag.listen().await.unwrap();
    registry.register_listener(Arc::clone(&flag));
    (flag, tracked)
}

#[tokio::test]
async fn clean_shutdown_drain_scenario() {
    let registry = FlagRegistry::new();
    let (_flag, tracked) = bind(&registry).await;
    let addr = tracked.addr().unwrap();

    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..3 {
        let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let server_side = tracked.accept().await.unwrap();
        clients.push(dialer.await.unwrap());
        servers.push(server_side);
    }

    tracked.close().unwrap();

    // While connections are still open, Accept returns the stopped
    // sentinel and Wait has not resolved.
    assert!(matches!(tracked.accept().await, Err(GracefulError::Stopped)));
    assert!(tokio::time::timeout(Duration::from_millis(50), tracked.wait())
        .await
        .is_err());

    drop(servers);
    drop(clients);

    tokio::time::timeout(Duration::from_secs(5), tracked.wait())
        .await
        .expect("drain should complete once all connections close");
}

#[tokio::test]
async fn shutdown_accept_returns_stopped_for_all_readers_after_stop() {
    let registry = FlagRegistry::new();
    let (_flag, tracked) = bind(&registry).await;
    tracked.stop().unwrap();

    for _ in 0..3 {
        assert!(matches!(tracked.accept().await, Err(GracefulError::Stopped)));
    }
}

#[tokio::test]
async fn restart_handoff_preserves_original_address() {
    let registry = FlagRegistry::new();
    let (flag, tracked) = bind(&registry).await;
    let addr = tracked.addr().unwrap();

    let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let long_lived = tracked.accept().await.unwrap();
    let client = dialer.await.unwrap();

    // Restart: stop (leave descriptor open), dup, rewrite the flag into
    // adopt mode, and confirm the round trip (`--listen=&N` refers to
    // the same bound socket the predecessor had).
    tracked.stop().unwrap();
    let dup_fd = tracked.dup().unwrap();
    flag.parse(&format!("&{dup_fd}")).unwrap();
    assert_eq!(flag.string(), format!("&{dup_fd}"));

    let argv = registry.to_argv();
    assert_eq!(argv, vec![format!("--listen=&{dup_fd}")]);

    let successor_flag = ListenerFlag::new("listen", Family::Tcp);
    successor_flag.parse(&format!("&{dup_fd}")).unwrap();
    let successor_listener = successor_flag.listen().await.unwrap();
    assert_eq!(successor_listener.addr().unwrap(), addr);

    let new_dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let accepted = successor_listener.accept().await.unwrap();
    let new_client = new_dialer.await.unwrap();
    drop(accepted);
    drop(new_client);

    drop(long_lived);
    drop(client);
    tokio::time::timeout(Duration::from_secs(5), tracked.wait())
        .await
        .expect("predecessor should drain once the original connection closes");
}

#[tokio::test]
async fn dup_leaves_original_descriptor_usable() {
    let registry = FlagRegistry::new();
    let (_flag, tracked) = bind(&registry).await;
    let addr = tracked.addr().unwrap();

    let dup_fd = tracked.dup().unwrap();

    let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let accepted = tracked.accept().await;
    assert!(accepted.is_ok());
    let _ = dialer.await;

    unsafe {
        libc::close(dup_fd);
    }
}

#[tokio::test]
async fn adopt_bad_descriptor_is_fatal_at_construction() {
    let flag = ListenerFlag::new("listen", Family::Tcp);
    flag.parse("&999").unwrap();
    let result = flag.listen().await;
    assert!(matches!(result, Err(GracefulError::AdoptFailure { fd: 999, .. })));
}
