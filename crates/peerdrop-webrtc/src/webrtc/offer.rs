//! Initiator flow: create the offer, deliver it, wait for the answer

use anyhow::{Context, Result};
use std::sync::Arc;

use peerdrop_common::core::negotiator::{ConnectionNegotiator, Role};
use peerdrop_common::signaling::channel::{
    ManualChannel, OutOfBandChannel, QrCodeChannel, UrlParameterChannel,
};
use peerdrop_common::signaling::codec::{decode, encode, EncodedSignal};

use super::exchange::{
    complete_transfer, present_delivery, read_pasted, wait_on_relay, SignalingOptions,
    TransferOptions, Via,
};
use super::transport::WebRtcTransportFactory;

pub async fn run_offer(signaling: SignalingOptions, transfer: TransferOptions) -> Result<()> {
    let payload = transfer.load_payload().await?;

    let negotiator = ConnectionNegotiator::new(Arc::new(WebRtcTransportFactory::new()));
    let mut session = negotiator.begin_initiator().await?;

    eprintln!("\nPreparing WebRTC offer...");
    let offer = encode(&session.local_descriptor().await?);

    let answer = exchange_offer(&signaling, &offer).await?;

    eprintln!("\nProcessing receiver's response...");
    session
        .apply_remote_descriptor(decode(answer.as_str())?)
        .await?;

    complete_transfer(session, payload, &transfer).await
}

/// Deliver the offer through the chosen channel and return the answer.
async fn exchange_offer(signaling: &SignalingOptions, offer: &EncodedSignal) -> Result<EncodedSignal> {
    match signaling.via {
        Via::Manual => {
            let mut channel = ManualChannel::stdio(Role::Initiator);
            channel.deliver(offer).await?;
            channel.poll().await?.context("No answer was pasted")
        }
        Via::Url => {
            let mut channel = UrlParameterChannel::new(signaling.base_url.clone());
            present_delivery(&channel.deliver(offer).await?);
            read_pasted(Role::Initiator).await
        }
        Via::Qr => {
            let mut channel =
                QrCodeChannel::new(UrlParameterChannel::new(signaling.base_url.clone()));
            present_delivery(&channel.deliver(offer).await?);
            read_pasted(Role::Initiator).await
        }
        Via::Relay => {
            let mut channel = signaling.relay_channel(Role::Initiator)?;
            channel.clear()?;
            present_delivery(&channel.deliver(offer).await?);
            let (_, answer) = wait_on_relay(channel, signaling.poll_interval).await?;
            Ok(answer)
        }
    }
}
