//! Steps shared by the `offer` and `accept` flows: channel selection,
//! presenting what was delivered, and the transfer once connected.

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use peerdrop_common::core::error::Interrupted;
use peerdrop_common::core::negotiator::{Role, Session};
use peerdrop_common::core::transfer::{
    format_bytes, DirectorySink, FileTransferSession, TransferPayload,
};
use peerdrop_common::signaling::channel::{DeliveryHandle, ManualChannel, OutOfBandChannel};
use peerdrop_common::signaling::codec::EncodedSignal;
use peerdrop_common::signaling::relay::{PollingRelayChannel, RelayPoller};
use peerdrop_common::signaling::store::DirStore;

/// Timeout for WebRTC connection (3 minutes to allow time for copy/paste signaling)
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(180);

/// How long a sender waits for the receiver to close after the last message
const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Page the shareable link points at (the web front end in development).
/// Only the `offer` parameter matters to this tool.
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/";

/// How the offer and answer travel between the two parties
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Via {
    /// Copy/paste armored text
    Manual,
    /// Link with the offer in its query string; the answer is pasted back
    Url,
    /// QR code of that link; the answer is pasted back
    Qr,
    /// Files in a directory both sides can reach, polled on an interval
    Relay,
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub via: Via,
    pub base_url: Url,
    pub relay_dir: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl SignalingOptions {
    pub fn relay_channel(&self, role: Role) -> Result<PollingRelayChannel> {
        let dir = self
            .relay_dir
            .as_ref()
            .context("--relay-dir is required with --via relay")?;
        let store = DirStore::new(dir)?;
        Ok(PollingRelayChannel::new(Arc::new(store), role))
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// File to send once connected. Without it this side receives.
    pub file: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub timeout: Duration,
}

impl TransferOptions {
    /// Read the file up front so a bad path fails before the handshake.
    pub async fn load_payload(&self) -> Result<Option<TransferPayload>> {
        match &self.file {
            Some(path) => Ok(Some(load(path).await?)),
            None => Ok(None),
        }
    }
}

async fn load(path: &Path) -> Result<TransferPayload> {
    let payload = TransferPayload::from_path(path).await?;
    eprintln!(
        "Prepared {} ({})",
        payload.suggested_name,
        format_bytes(payload.len() as u64)
    );
    Ok(payload)
}

/// Show the user what a channel produced.
pub fn present_delivery(handle: &DeliveryHandle) {
    match handle {
        DeliveryHandle::Displayed => {}
        DeliveryHandle::Url(url) => {
            eprintln!("\nShare this link with the receiver:");
            println!("{}", url);
            eprintln!("\nOn another machine: peerdrop-webrtc accept --url '{}'", url);
        }
        DeliveryHandle::QrCode { url, image } => {
            eprintln!("\nScan this QR code on the receiving device:");
            println!("{}", image);
            eprintln!("Link: {}", url);
        }
        DeliveryHandle::Stored { key } => {
            eprintln!("Wrote {} to the relay directory", key);
        }
    }
}

/// Read the peer's signal pasted on stdin.
pub async fn read_pasted(role: Role) -> Result<EncodedSignal> {
    ManualChannel::stdio(role)
        .poll()
        .await?
        .context("No signal was pasted")
}

/// Poll the relay until the peer's signal shows up.
pub async fn wait_on_relay(
    channel: PollingRelayChannel,
    interval: Duration,
) -> Result<(PollingRelayChannel, EncodedSignal)> {
    eprintln!("Waiting for the peer (checking every {:?})...", interval);
    let mut poller = RelayPoller::spawn(channel, interval);
    poller.recv().await
}

/// Wait for the connection, then send or receive. Ctrl+C aborts with
/// [`Interrupted`].
pub async fn complete_transfer(
    session: Session,
    payload: Option<TransferPayload>,
    options: &TransferOptions,
) -> Result<()> {
    tokio::select! {
        result = run_transfer(session, payload, options) => result,
        _ = interrupted(tokio::signal::ctrl_c()) => {
            eprintln!("\nInterrupted");
            Err(Interrupted.into())
        }
    }
}

/// Resolves when `signal` reports Ctrl+C. If the handler could not be
/// installed this never resolves, so the transfer runs to completion.
async fn interrupted<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        log::warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_transfer(
    mut session: Session,
    payload: Option<TransferPayload>,
    options: &TransferOptions,
) -> Result<()> {
    session.wait_connected(Some(options.timeout)).await?;

    let sink = match &options.output {
        Some(dir) => DirectorySink::new(dir),
        None => DirectorySink::current_dir()?,
    };
    let mut transfer = FileTransferSession::new(session, sink);

    match payload {
        Some(payload) => {
            if let Err(e) = transfer.send(&payload).await {
                log::error!("Failed to send {}: {}", payload.suggested_name, e);
                return Err(e.into());
            }
            eprintln!("Waiting for the receiver to confirm...");
            if !transfer
                .session_mut()
                .wait_peer_close(PEER_CLOSE_TIMEOUT)
                .await
            {
                log::warn!(
                    "Receiver did not close the connection within {:?}",
                    PEER_CLOSE_TIMEOUT
                );
            }
            eprintln!("Transfer complete!");
        }
        None => {
            eprintln!("Waiting for the file...");
            let saved = transfer.receive_next().await?;
            match &saved.location {
                Some(path) => eprintln!(
                    "Saved {} to {}",
                    format_bytes(saved.size),
                    path.display()
                ),
                None => eprintln!("Received {}", format_bytes(saved.size)),
            }
        }
    }

    transfer.session_mut().close().await;
    Ok(())
}
