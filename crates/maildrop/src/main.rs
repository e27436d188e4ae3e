//! maildrop POP3 server binary.
//!
//! # Usage
//!
//! ```bash
//! # Plaintext on port 1110
//! maildrop --mailbox crates/maildrop/fixtures/mailbox.json --port 1110
//!
//! # Implicit TLS on port 995
//! maildrop --mailbox mailbox.json --cert cert.pem --key key.pem
//!
//! # Settings from a file, flags override it
//! maildrop --config crates/maildrop/fixtures/settings.json --log-level debug
//! ```

mod mailbox;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use maildrop_pop3::{Server, ServerHandle, backend};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mailbox::MemoryMailbox;
use settings::{Args, FileSettings, Settings};

/// Log filter when neither `--log-level` nor `RUST_LOG` is set.
const DEFAULT_FILTER: &str = "maildrop=info,maildrop_pop3=info";

/// Delegations queued between connections and the mailbox backend.
const DELEGATION_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = match &args.config {
        Some(path) => FileSettings::load(path)?,
        None => FileSettings::default(),
    };
    let settings = Settings::resolve(args, file)?;

    init_tracing(settings.log_level.as_deref());

    let handle = start(settings).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    handle.stop().await?;
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = level.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        EnvFilter::new,
    );

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

async fn start(settings: Settings) -> Result<ServerHandle> {
    let mailbox = Arc::new(MemoryMailbox::load(&settings.mailbox)?);
    tracing::info!(
        path = %settings.mailbox.display(),
        accounts = mailbox.accounts(),
        "mailboxes loaded"
    );

    let (bridge, delegations) =
        backend::channel(DELEGATION_QUEUE, settings.server.backend_timeout());
    tokio::spawn(backend::serve(Arc::clone(&mailbox), delegations));

    let handle = Server::new(settings.server, bridge)
        .context("failed to set up server")?
        .with_observer(mailbox)
        .start()
        .await
        .context("failed to start server")?;

    tracing::info!(addr = %handle.local_addr(), "maildrop ready");
    Ok(handle)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn test_serves_sample_fixture() {
        let mailbox = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/mailbox.json");
        let args = Args::parse_from(["maildrop", "--mailbox", mailbox, "--host", "127.0.0.1", "--port", "0"]);
        let settings = Settings::resolve(args, FileSettings::default()).unwrap();
        let handle = start(settings).await.unwrap();

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b"USER alice\r\nPASS secret\r\nSTAT\r\nRETR 2\r\nQUIT\r\n")
            .await
            .unwrap();

        let mut transcript = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            transcript.push(line);
        }

        assert_eq!(transcript[0], "+OK POP3 server ready");
        assert_eq!(transcript[2], "+OK Logged in");
        assert!(transcript[3].starts_with("+OK 2 "));
        assert_eq!(transcript[4], "+OK Message follows");
        assert!(transcript.contains(&"..".to_string()));
        assert_eq!(transcript.last().unwrap(), "+OK POP3 server signing off");

        handle.stop().await.unwrap();
    }
}
