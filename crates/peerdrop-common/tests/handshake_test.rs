use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use peerdrop_common::core::error::SessionError;
use peerdrop_common::core::negotiator::{ConnectionNegotiator, Role, Session, SessionState};
use peerdrop_common::core::transfer::{
    DirectorySink, FileTransferSession, MemorySink, TransferPayload, RECEIVED_FILE_NAME,
};
use peerdrop_common::signaling::channel::{
    DeliveryHandle, ManualChannel, OutOfBandChannel, UrlParameterChannel,
};
use peerdrop_common::signaling::codec::{decode, encode, SignalingDescriptor};
use peerdrop_common::signaling::relay::{
    PollingRelayChannel, RelayPoller, ANSWER_KEY, OFFER_KEY,
};
use peerdrop_common::signaling::store::{MemoryStore, SharedStore};
use peerdrop_common::transport::loopback::LoopbackFactory;

const TICK: Duration = Duration::from_millis(10);
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn negotiator(factory: &LoopbackFactory) -> ConnectionNegotiator {
    ConnectionNegotiator::new(Arc::new(factory.clone()))
}

/// Deliver through a manual channel and return what the user would copy.
async fn manual_deliver(role: Role, descriptor: &SignalingDescriptor) -> String {
    let mut channel = ManualChannel::new(Cursor::new(Vec::new()), Vec::new(), role);
    let handle = channel.deliver(&encode(descriptor)).await.unwrap();
    assert_eq!(handle, DeliveryHandle::Displayed);
    let (_, output) = channel.into_parts();
    String::from_utf8(output).unwrap()
}

/// Paste copied text into a manual channel and decode what it returns.
async fn manual_paste(role: Role, copied: String) -> SignalingDescriptor {
    let mut channel = ManualChannel::new(Cursor::new(copied.into_bytes()), Vec::new(), role);
    let signal = channel.poll().await.unwrap().expect("pasted signal");
    decode(signal.as_str()).unwrap()
}

async fn send_three_bytes(sender: Session, receiver: Session) {
    let mut sending = FileTransferSession::new(sender, MemorySink::new());
    let sink = MemorySink::new();
    let mut receiving = FileTransferSession::new(receiver, sink.clone());

    sending
        .send(&TransferPayload::new(vec![0x01, 0x02, 0x03], "three.bin"))
        .await
        .unwrap();
    let saved = tokio::time::timeout(TEST_TIMEOUT, receiving.receive_next())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(saved.name, RECEIVED_FILE_NAME);
    assert_eq!(saved.size, 3);
    let artifacts = sink.artifacts();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "received_file");
    assert_eq!(artifacts[0].bytes, Bytes::from_static(&[0x01, 0x02, 0x03]));
}

// =============================================================================
// Scenario A: manual copy/paste
// =============================================================================

#[tokio::test]
async fn test_manual_copy_paste_handshake_and_transfer() {
    let factory = LoopbackFactory::new();

    // Party 1 creates the offer and shows it.
    let mut party1 = negotiator(&factory).begin_initiator().await.unwrap();
    let d1 = party1.local_descriptor().await.unwrap();
    let copied_offer = manual_deliver(Role::Initiator, &d1).await;

    // Party 2 pastes it, answers and shows the answer.
    let received_offer = manual_paste(Role::Responder, copied_offer).await;
    assert_eq!(received_offer, d1);
    let mut party2 = negotiator(&factory).begin_responder(received_offer).await.unwrap();
    let d2 = party2.local_descriptor().await.unwrap();
    let copied_answer = manual_deliver(Role::Responder, &d2).await;

    // Party 1 pastes the answer.
    let received_answer = manual_paste(Role::Initiator, copied_answer).await;
    party1.apply_remote_descriptor(received_answer).await.unwrap();

    party1.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();
    party2.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();
    assert_eq!(party1.state(), SessionState::Connected);
    assert_eq!(party2.state(), SessionState::Connected);

    send_three_bytes(party1, party2).await;
}

// =============================================================================
// Scenario B: URL query parameter
// =============================================================================

#[tokio::test]
async fn test_url_parameter_starts_responder_without_paste() {
    let factory = LoopbackFactory::new();
    let base = url::Url::parse("https://peerdrop.invalid/").unwrap();

    let mut party1 = negotiator(&factory).begin_initiator().await.unwrap();
    let d1 = party1.local_descriptor().await.unwrap();
    let mut outbound = UrlParameterChannel::new(base.clone());
    let DeliveryHandle::Url(link) = outbound.deliver(&encode(&d1)).await.unwrap() else {
        panic!("expected a shareable link");
    };

    // Party 2 "loads the page" with the link.
    let mut page = UrlParameterChannel::new(base).with_page_url(link);
    let signal = page.poll().await.unwrap().expect("offer in query string");
    let mut party2 = negotiator(&factory)
        .begin_responder(decode(signal.as_str()).unwrap())
        .await
        .unwrap();
    assert_eq!(party2.remote(), Some(&d1));

    // From here on identical to the manual flow.
    let d2 = party2.local_descriptor().await.unwrap();
    let answer = manual_paste(Role::Initiator, manual_deliver(Role::Responder, &d2).await).await;
    party1.apply_remote_descriptor(answer).await.unwrap();
    party1.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();
    party2.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();

    // The query string is read once only.
    assert_eq!(page.poll().await.unwrap(), None);

    send_three_bytes(party1, party2).await;
}

// =============================================================================
// Scenario C: polling relay
// =============================================================================

#[tokio::test]
async fn test_polling_relay_handshake_applies_answer_once() {
    let factory = LoopbackFactory::new();
    let store = Arc::new(MemoryStore::new());
    store.set(ANSWER_KEY, "stale answer from an earlier run").unwrap();

    // Party 1 clears stale keys, writes D1 and starts polling for the answer.
    let mut party1 = negotiator(&factory).begin_initiator().await.unwrap();
    let mut relay1 = PollingRelayChannel::new(store.clone(), Role::Initiator);
    relay1.clear().unwrap();
    let d1 = party1.local_descriptor().await.unwrap();
    relay1.deliver(&encode(&d1)).await.unwrap();
    let mut answer_poller = RelayPoller::spawn(relay1, TICK);

    // Party 2 polls for the offer, answers through the relay.
    let relay2 = PollingRelayChannel::new(store.clone(), Role::Responder);
    let mut offer_poller = RelayPoller::spawn(relay2, TICK);
    let (mut relay2, offer) = tokio::time::timeout(TEST_TIMEOUT, offer_poller.recv())
        .await
        .unwrap()
        .unwrap();
    let mut party2 = negotiator(&factory)
        .begin_responder(decode(offer.as_str()).unwrap())
        .await
        .unwrap();
    let d2 = party2.local_descriptor().await.unwrap();
    relay2.deliver(&encode(&d2)).await.unwrap();

    // Party 1's poll picks up D2 and applies it.
    let (mut relay1, answer) = tokio::time::timeout(TEST_TIMEOUT, answer_poller.recv())
        .await
        .unwrap()
        .unwrap();
    let d2_seen = decode(answer.as_str()).unwrap();
    assert_eq!(d2_seen, d2);
    party1.apply_remote_descriptor(d2_seen).await.unwrap();
    party1.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();
    party2.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();

    // Further ticks never hand the answer out again, so nothing can reach
    // apply_remote_descriptor a second time.
    for _ in 0..5 {
        tokio::time::sleep(TICK).await;
        assert_eq!(relay1.poll().await.unwrap(), None);
    }
    let mut idle_poller = RelayPoller::spawn(relay1, TICK);
    assert!(tokio::time::timeout(TICK * 10, idle_poller.recv()).await.is_err());
    idle_poller.cancel();

    assert_eq!(party1.remote(), Some(&d2));
    assert_eq!(party1.state(), SessionState::Connected);
    assert!(store.get(OFFER_KEY).unwrap().is_some());

    send_three_bytes(party1, party2).await;
}

// =============================================================================
// Transfer edge cases
// =============================================================================

#[tokio::test]
async fn test_send_before_connected_transmits_nothing() {
    let factory = LoopbackFactory::new();
    let mut initiator = negotiator(&factory).begin_initiator().await.unwrap();
    initiator.local_descriptor().await.unwrap();

    let mut transfer = FileTransferSession::new(initiator, MemorySink::new());
    let result = transfer
        .send(&TransferPayload::new(vec![0x01, 0x02, 0x03], "early.bin"))
        .await;

    assert_eq!(result, Err(SessionError::ChannelNotReady));
    assert_eq!(factory.messages_sent(), 0);
    assert_eq!(
        transfer.session().state(),
        SessionState::AwaitingRemoteDescriptor
    );
}

#[tokio::test]
async fn test_received_file_lands_in_output_directory() {
    let factory = LoopbackFactory::new();
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("holiday.jpg");
    std::fs::write(&source, b"not really a jpeg").unwrap();
    let output = dir.path().join("downloads");

    let mut initiator = negotiator(&factory).begin_initiator().await.unwrap();
    let offer = initiator.local_descriptor().await.unwrap();
    let mut responder = negotiator(&factory).begin_responder(offer).await.unwrap();
    let answer = responder.local_descriptor().await.unwrap();
    initiator.apply_remote_descriptor(answer).await.unwrap();
    initiator.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();
    responder.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();

    // Either side may send; here the responder does.
    let mut sender = FileTransferSession::new(responder, MemorySink::new());
    let mut receiver = FileTransferSession::new(initiator, DirectorySink::new(&output));

    let payload = TransferPayload::from_path(&source).await.unwrap();
    sender.send(&payload).await.unwrap();
    let saved = receiver.receive_next().await.unwrap();

    let location = saved.location.unwrap();
    assert_eq!(location, output.join("received_file"));
    assert_eq!(std::fs::read(location).unwrap(), b"not really a jpeg");

    // Sender tears down; the receiver sees the close.
    sender.session_mut().close().await;
    assert!(
        receiver
            .session_mut()
            .wait_peer_close(Duration::from_secs(1))
            .await
    );
    assert_eq!(factory.open_transports(), 0);
}

#[tokio::test]
async fn test_message_received_before_close_is_still_delivered() {
    let factory = LoopbackFactory::new();
    let mut initiator = negotiator(&factory).begin_initiator().await.unwrap();
    let offer = initiator.local_descriptor().await.unwrap();
    let mut responder = negotiator(&factory).begin_responder(offer).await.unwrap();
    let answer = responder.local_descriptor().await.unwrap();
    initiator.apply_remote_descriptor(answer).await.unwrap();
    initiator.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();
    responder.wait_connected(Some(TEST_TIMEOUT)).await.unwrap();

    initiator
        .send_message(Bytes::from_static(b"last words"))
        .await
        .unwrap();
    initiator.close().await;

    // Drain the close first, then ask for the message.
    assert!(responder.wait_peer_close(Duration::from_secs(1)).await);
    assert_eq!(
        responder.next_message().await.unwrap(),
        Bytes::from_static(b"last words")
    );
    assert!(matches!(
        responder.next_message().await,
        Err(SessionError::TransportFailure(_))
    ));
}
