//! peerdrop-webrtc: serverless peer-to-peer file transfer over WebRTC
//!
//! No signaling server is involved. The offer and the answer travel through
//! whatever the two people already share: a chat (copy/paste), a link, a QR
//! code, or a directory both machines can see.
//!
//! Build with: cargo build -p peerdrop-webrtc

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use peerdrop_common::core::error::is_interrupted;
use peerdrop_common::signaling::relay::DEFAULT_POLL_INTERVAL;

mod webrtc;

use crate::webrtc::exchange::{
    SignalingOptions, TransferOptions, Via, CONNECTION_TIMEOUT, DEFAULT_BASE_URL,
};

#[derive(Parser)]
#[command(name = "peerdrop-webrtc")]
#[command(about = "Serverless peer-to-peer file transfer using WebRTC data channels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an offer and wait for the peer's answer
    Offer {
        #[command(flatten)]
        signaling: SignalingArgs,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Answer a peer's offer
    Accept {
        /// Link carrying the offer in its `offer` parameter (skips pasting)
        #[arg(long, value_name = "URL")]
        url: Option<Url>,

        #[command(flatten)]
        signaling: SignalingArgs,

        #[command(flatten)]
        transfer: TransferArgs,
    },
}

#[derive(Args)]
struct SignalingArgs {
    /// How the offer and answer are exchanged
    #[arg(long, value_enum, default_value_t = Via::Manual)]
    via: Via,

    /// Page the shareable link points at (--via url/qr)
    #[arg(long, value_name = "URL", default_value = DEFAULT_BASE_URL)]
    base_url: Url,

    /// Directory shared by both machines (--via relay)
    #[arg(long, value_name = "DIR")]
    relay_dir: Option<PathBuf>,

    /// Seconds between relay checks
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = DEFAULT_POLL_INTERVAL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval: u64,
}

#[derive(Args)]
struct TransferArgs {
    /// File to send once connected (receive if omitted)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Output directory (defaults to current directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds to wait for the connection after the handshake
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = CONNECTION_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: u64,
}

impl From<SignalingArgs> for SignalingOptions {
    fn from(args: SignalingArgs) -> Self {
        Self {
            via: args.via,
            base_url: args.base_url,
            relay_dir: args.relay_dir,
            poll_interval: Duration::from_secs(args.poll_interval),
        }
    }
}

impl From<TransferArgs> for TransferOptions {
    fn from(args: TransferArgs) -> Self {
        Self {
            file: args.file,
            output: args.output,
            timeout: Duration::from_secs(args.timeout),
        }
    }
}

fn main() {
    // Run the async main and handle errors
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime")
        .block_on(async_main());

    if let Err(e) = result {
        if is_interrupted(&e) {
            // Exit with 128 + SIGINT (2) = 130, standard Unix convention
            std::process::exit(130);
        }
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with filters for noisy internal modules
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = format!("{},webrtc_ice=error,webrtc_sctp=warn", log_level);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&filter)).init();

    match cli.command {
        Commands::Offer {
            signaling,
            transfer,
        } => {
            crate::webrtc::run_offer(signaling.into(), transfer.into()).await?;
        }

        Commands::Accept {
            url,
            signaling,
            transfer,
        } => {
            crate::webrtc::run_accept(url, signaling.into(), transfer.into()).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_offer_defaults() {
        let cli =
            Cli::try_parse_from(["peerdrop-webrtc", "offer", "--file", "photo.jpg"]).unwrap();
        let Commands::Offer {
            signaling,
            transfer,
        } = cli.command
        else {
            panic!("expected offer");
        };
        let signaling = SignalingOptions::from(signaling);
        let transfer = TransferOptions::from(transfer);

        assert_eq!(signaling.via, Via::Manual);
        assert_eq!(signaling.base_url.as_str(), DEFAULT_BASE_URL);
        assert_eq!(signaling.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(transfer.file, Some(PathBuf::from("photo.jpg")));
        assert_eq!(transfer.timeout, CONNECTION_TIMEOUT);
    }

    #[test]
    fn test_accept_with_url_and_relay() {
        let cli = Cli::try_parse_from([
            "peerdrop-webrtc",
            "accept",
            "--url",
            "http://localhost:3000/?offer=abc",
            "--via",
            "relay",
            "--relay-dir",
            "/tmp/relay",
            "--poll-interval",
            "5",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Accept { url, signaling, .. } = cli.command else {
            panic!("expected accept");
        };
        assert_eq!(url.unwrap().query(), Some("offer=abc"));
        let signaling = SignalingOptions::from(signaling);
        assert_eq!(signaling.via, Via::Relay);
        assert_eq!(signaling.relay_dir, Some(PathBuf::from("/tmp/relay")));
        assert_eq!(signaling.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let result = Cli::try_parse_from(["peerdrop-webrtc", "offer", "--poll-interval", "0"]);
        assert!(result.is_err());
    }
}
