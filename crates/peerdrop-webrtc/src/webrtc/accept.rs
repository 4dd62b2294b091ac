//! Responder flow: obtain the offer, answer it, wait for the connection

use anyhow::{Context, Result};
use std::sync::Arc;
use url::Url;

use peerdrop_common::core::negotiator::{ConnectionNegotiator, Role};
use peerdrop_common::signaling::channel::{ManualChannel, OutOfBandChannel, UrlParameterChannel};
use peerdrop_common::signaling::codec::{decode, encode, EncodedSignal};
use peerdrop_common::signaling::relay::PollingRelayChannel;

use super::exchange::{
    complete_transfer, present_delivery, read_pasted, wait_on_relay, SignalingOptions,
    TransferOptions, Via,
};
use super::transport::WebRtcTransportFactory;

/// Answer an offer. With `page_url` the offer is taken from its query
/// string and no paste is needed.
pub async fn run_accept(
    page_url: Option<Url>,
    signaling: SignalingOptions,
    transfer: TransferOptions,
) -> Result<()> {
    let payload = transfer.load_payload().await?;

    let (offer, relay) = obtain_offer(page_url, &signaling).await?;

    let negotiator = ConnectionNegotiator::new(Arc::new(WebRtcTransportFactory::new()));
    let mut session = negotiator
        .begin_responder(decode(offer.as_str())?)
        .await?;

    eprintln!("\nPreparing WebRTC answer...");
    let answer = encode(&session.local_descriptor().await?);

    if signaling.via == Via::Relay {
        let mut channel = match relay {
            Some(channel) => channel,
            None => signaling.relay_channel(Role::Responder)?,
        };
        present_delivery(&channel.deliver(&answer).await?);
    } else {
        ManualChannel::stdio(Role::Responder).deliver(&answer).await?;
    }

    eprintln!("Waiting for the sender to connect...");
    complete_transfer(session, payload, &transfer).await
}

/// The relay channel is handed back when the offer came through it, so the
/// answer goes out on the same channel.
async fn obtain_offer(
    page_url: Option<Url>,
    signaling: &SignalingOptions,
) -> Result<(EncodedSignal, Option<PollingRelayChannel>)> {
    if let Some(page_url) = page_url {
        let mut channel =
            UrlParameterChannel::new(signaling.base_url.clone()).with_page_url(page_url);
        let offer = channel
            .poll()
            .await?
            .context("The URL does not carry an offer parameter")?;
        return Ok((offer, None));
    }

    match signaling.via {
        Via::Relay => {
            let channel = signaling.relay_channel(Role::Responder)?;
            let (channel, offer) = wait_on_relay(channel, signaling.poll_interval).await?;
            Ok((offer, Some(channel)))
        }
        Via::Manual | Via::Url | Via::Qr => Ok((read_pasted(Role::Responder).await?, None)),
    }
}
