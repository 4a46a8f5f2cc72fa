//! Minimal embedder: register one listener flag, parse argv, `Listen()`,
//! serve an echo handler, and hand control to the signal controller.
//!
//! ```text
//! echo-server --listen=127.0.0.1:7000
//! # then, elsewhere:
//! kill -HUP <pid>   # zero-downtime restart
//! kill -TERM <pid>  # graceful shutdown
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use graceful::{Family, FlagRegistry, Level, Lifecycle, ListenerFlag, PlainFlag, Sink, SignalController};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser, Debug)]
#[clap(name = "echo-server", version, author, about = "A graceful-restart echo server")]
struct Cli {
    #[clap(long, default_value = "127.0.0.1:7000")]
    listen: String,

    #[clap(long, default_value_t = 2)]
    loglevel: i32,

    #[clap(long)]
    logfile: Option<PathBuf>,
}

struct LogLevelFlag(i32);

impl PlainFlag for LogLevelFlag {
    fn name(&self) -> &str {
        "loglevel"
    }
    fn value(&self) -> String {
        self.0.to_string()
    }
}

struct LogFileFlag(Option<PathBuf>);

impl PlainFlag for LogFileFlag {
    fn name(&self) -> &str {
        "logfile"
    }
    fn value(&self) -> String {
        self.0
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default()
    }
}

#[tokio::main]
async fn main() {
    let _ = graceful::init_tracing();

    let cli = Cli::parse();

    let sink = Arc::new(Sink::new());
    sink.set_threshold(Level(cli.loglevel));
    if let Some(path) = &cli.logfile {
        // A restart round-trip re-parses `--logfile=` with no value as
        // `Some(PathBuf::from(""))`; treat that the same as absent.
        if !path.as_os_str().is_empty() {
            if let Err(err) = sink.set_file(path, 0o644) {
                eprintln!("failed to open log file {}: {err}", path.display());
            }
        }
    }

    let registry = Arc::new(FlagRegistry::new());

    let listen_flag = Arc::new(ListenerFlag::new("listen", Family::Tcp));
    listen_flag.parse(&cli.listen).expect("invalid --listen value");
    registry.register_listener(Arc::clone(&listen_flag));
    registry.register_plain(Box::new(LogLevelFlag(cli.loglevel)));
    registry.register_plain(Box::new(LogFileFlag(cli.logfile.clone())));

    let tracked = match listen_flag.listen().await {
        Ok(tracked) => tracked,
        Err(err) => {
            graceful::printf!(sink, Level::FATAL, "failed to activate --listen: {err}");
            unreachable!("Fatal printf exits the process");
        }
    };
    graceful::printf!(sink, Level::INFO, "listening on {}", tracked.addr().unwrap());

    tokio::spawn({
        let tracked = Arc::clone(&tracked);
        let sink = Arc::clone(&sink);
        async move {
            loop {
                match tracked.accept().await {
                    Ok(conn) => {
                        tokio::spawn(handle_connection(conn));
                    }
                    Err(graceful::GracefulError::Stopped) => break,
                    Err(err) => {
                        graceful::printf!(sink, Level::WARNING, "accept error: {err}");
                    }
                }
            }
        }
    });

    let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&registry), Arc::clone(&sink)));
    SignalController::new(lifecycle, sink).run().await;
}

async fn handle_connection(mut conn: graceful::TrackedConnection) {
    let mut buf = [0u8; 1024];
    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if conn.write_all(&buf[..n]).await.is_err() {
            return;
        }
    }
}
