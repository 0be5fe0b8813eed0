use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, Mutex},
    time::{timeout, Instant},
};

use coap::{
    types::{BlockOption, Code, Endpoint, Message, MessageType, OptionNumber},
    Client, ClientEvent, RequestEvent, RequestHandle, RequestOptions, Transport,
};

/// Channel-backed transport: the test plays the server, scripting every
/// datagram in both directions under the paused tokio clock.
struct ScriptedTransport {
    incoming: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    outgoing: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((data, from)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), from))
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "script ended")),
        }
    }

    async fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        let _ = self.outgoing.send((buf.to_vec(), to));
        Ok(buf.len())
    }
}

struct TestServer {
    addr: SocketAddr,
    to_client: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    from_client: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
}

impl TestServer {
    fn new() -> (Self, ScriptedTransport) {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();

        let server = Self {
            addr: "127.0.0.1:5683".parse().unwrap(),
            to_client,
            from_client,
        };
        let transport = ScriptedTransport {
            incoming: Mutex::new(incoming),
            outgoing,
        };

        (server, transport)
    }

    fn endpoint(&self) -> Endpoint {
        self.addr.into()
    }

    /// The next datagram the client sends, decoded.
    async fn expect_message(&mut self) -> Message {
        let (data, to) = self
            .from_client
            .recv()
            .await
            .expect("client stopped sending");
        assert_eq!(to, self.addr);
        Message::from_bytes(&data).expect("client sent a malformed datagram")
    }

    /// Asserts the client has nothing in flight.
    fn assert_quiet(&mut self) {
        assert!(
            self.from_client.try_recv().is_err(),
            "client sent an unexpected message"
        );
    }

    fn inject(&self, message: &Message) {
        let _ = self
            .to_client
            .send((message.to_bytes().unwrap(), self.addr));
    }
}

fn test_client(transport: ScriptedTransport) -> Client {
    Client::builder()
        .with_ack_random_factor(1.0)
        .build_with_transport(transport)
}

/// ACK carrying a piggy-backed response.
fn piggyback(request: &Message, code: Code, payload: &[u8]) -> Message {
    let mut response = Message::new(MessageType::Acknowledgement, code);
    response.header.message_id = request.message_id();
    response.set_token(request.token().to_vec()).unwrap();
    response.set_payload(payload.to_vec());
    response
}

/// Separate (server-initiated) response or notification.
fn separate(token: &[u8], mtype: MessageType, code: Code, mid: u16, payload: &[u8]) -> Message {
    let mut response = Message::new(mtype, code);
    response.header.message_id = mid;
    response.set_token(token.to_vec()).unwrap();
    response.set_payload(payload.to_vec());
    response
}

async fn next_event(request: &mut RequestHandle) -> RequestEvent {
    request.event().await.expect("event stream ended early")
}

/// With the clock paused, a zero-progress wait proves no event is pending.
async fn assert_no_event(request: &mut RequestHandle) {
    assert!(
        timeout(Duration::from_millis(10), request.event())
            .await
            .is_err(),
        "request delivered an unexpected event"
    );
}

#[tokio::test(start_paused = true)]
async fn simple_get_piggybacked() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.get("coap://127.0.0.1/temperature").unwrap();

    let sent = server.expect_message().await;
    assert_eq!(sent.mtype(), MessageType::Confirmable);
    assert_eq!(sent.code(), Code::GET);
    assert_eq!(sent.message_id(), 1);
    assert_eq!(sent.uri_path(), "/temperature");

    server.inject(&piggyback(&sent, Code::CONTENT, b"22.3 C"));

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(ack) => assert_eq!(ack.payload(), b"22.3 C"),
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Response(response) => {
            assert_eq!(response.code(), Code::CONTENT);
            assert_eq!(response.payload(), b"22.3 C");
        }
        other => panic!("expected response, got {:?}", other),
    }

    // The exchange is done; no retransmission, no further events.
    server.assert_quiet();
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn confirmable_timeout_follows_the_doubling_schedule() {
    let (mut server, transport) = TestServer::new();
    let mut client = test_client(transport);
    let mut events = client.events().unwrap();

    let start = Instant::now();
    let mut request = client.get("coap://127.0.0.1/silent").unwrap();

    let initial = server.expect_message().await;
    assert_eq!(Instant::now() - start, Duration::ZERO);

    // Four retransmissions on the doubling schedule, byte-identical.
    let mut offsets = Vec::new();
    for _ in 0..4 {
        let copy = server.expect_message().await;
        assert_eq!(copy.message_id(), initial.message_id());
        offsets.push(Instant::now() - start);
    }
    assert_eq!(
        offsets,
        vec![
            Duration::from_millis(2000),
            Duration::from_millis(6000),
            Duration::from_millis(14000),
            Duration::from_millis(30000),
        ]
    );

    match next_event(&mut request).await {
        RequestEvent::Timeout => {}
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(Instant::now() - start, Duration::from_millis(62000));

    // Five copies on the wire, then the client-level timeout event.
    let mut sent = 0;
    loop {
        match events.recv().await.expect("client event stream ended") {
            ClientEvent::MessageSent(_) => sent += 1,
            ClientEvent::TransactionTimeout(_) => break,
            other => panic!("unexpected client event {:?}", other),
        }
    }
    assert_eq!(sent, 5);
}

#[tokio::test(start_paused = true)]
async fn blockwise_get_with_early_negotiation() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let body: Vec<u8> = (0..160u32).map(|i| i as u8).collect();
    let options = RequestOptions {
        block_size: Some(64),
        ..Default::default()
    };
    let mut request = client
        .get_with("coap://127.0.0.1/data", options)
        .unwrap();

    // Early negotiation: Block2 NUM=0, M=0, 64 bytes.
    let first = server.expect_message().await;
    let negotiated = first.block2().unwrap().unwrap();
    assert_eq!(
        (negotiated.num, negotiated.more, negotiated.size()),
        (0, false, 64)
    );

    let mut response = piggyback(&first, Code::CONTENT, &body[0..64]);
    response
        .set_block2(BlockOption::from_size(0, true, 64).unwrap())
        .unwrap();
    server.inject(&response);

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::BlockReceived(block) => assert_eq!(block.payload(), &body[0..64]),
        other => panic!("expected block received, got {:?}", other),
    }

    // The client fetches the rest with fresh message IDs and the same token.
    let second = server.expect_message().await;
    assert_ne!(second.message_id(), first.message_id());
    assert_eq!(second.token(), first.token());
    let asked = second.block2().unwrap().unwrap();
    assert_eq!((asked.num, asked.size()), (1, 64));

    let mut response = piggyback(&second, Code::CONTENT, &body[64..128]);
    response
        .set_block2(BlockOption::from_size(1, true, 64).unwrap())
        .unwrap();
    server.inject(&response);
    match next_event(&mut request).await {
        RequestEvent::BlockReceived(_) => {}
        other => panic!("expected block received, got {:?}", other),
    }

    let third = server.expect_message().await;
    let asked = third.block2().unwrap().unwrap();
    assert_eq!(asked.num, 2);

    let mut response = piggyback(&third, Code::CONTENT, &body[128..160]);
    response
        .set_block2(BlockOption::from_size(2, false, 64).unwrap())
        .unwrap();
    server.inject(&response);
    match next_event(&mut request).await {
        RequestEvent::BlockReceived(_) => {}
        other => panic!("expected block received, got {:?}", other),
    }

    // One response carrying the reassembled body.
    match next_event(&mut request).await {
        RequestEvent::Response(response) => {
            assert_eq!(response.code(), Code::CONTENT);
            assert_eq!(response.payload(), &body[..]);
        }
        other => panic!("expected response, got {:?}", other),
    }
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn blockwise_put_with_one_retransmission() {
    let (mut server, transport) = TestServer::new();
    let client = Client::builder()
        .with_ack_random_factor(1.0)
        .with_block_size(128)
        .build_with_transport(transport);

    let body = vec![0x5A; 319];
    let mut request = client.put("coap://127.0.0.1/firmware", body.clone()).unwrap();

    // Block 0: NUM=0, M=1, 128 bytes.
    let block0 = server.expect_message().await;
    let option = block0.block1().unwrap().unwrap();
    assert_eq!((option.num, option.more, option.size()), (0, true, 128));
    assert_eq!(block0.payload(), &body[0..128]);

    let mut ack = piggyback(&block0, Code::CONTINUE, &[]);
    ack.set_block1(BlockOption::new(0, true, 3).unwrap()).unwrap();
    server.inject(&ack);

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::BlockSent(block) => assert_eq!(block.num, 0),
        other => panic!("expected block sent, got {:?}", other),
    }

    // Block 1 goes out; the server stays silent for one retry period.
    let block1 = server.expect_message().await;
    assert_eq!(block1.block1().unwrap().unwrap().num, 1);
    let sent_at = Instant::now();

    let copy = server.expect_message().await;
    assert_eq!(copy.message_id(), block1.message_id());
    assert_eq!(copy.payload(), block1.payload());
    assert_eq!(Instant::now() - sent_at, Duration::from_millis(2000));

    let mut ack = piggyback(&block1, Code::CONTINUE, &[]);
    ack.set_block1(BlockOption::new(1, true, 3).unwrap()).unwrap();
    server.inject(&ack);
    match next_event(&mut request).await {
        RequestEvent::BlockSent(block) => assert_eq!(block.num, 1),
        other => panic!("expected block sent, got {:?}", other),
    }

    // Block 2: NUM=2, M=0, the 63-byte tail.
    let block2 = server.expect_message().await;
    let option = block2.block1().unwrap().unwrap();
    assert_eq!((option.num, option.more), (2, false));
    assert_eq!(block2.payload(), &body[256..]);

    let mut ack = piggyback(&block2, Code::CHANGED, &[]);
    ack.set_block1(BlockOption::new(2, false, 3).unwrap()).unwrap();
    server.inject(&ack);

    match next_event(&mut request).await {
        RequestEvent::BlockSent(block) => assert_eq!(block.num, 2),
        other => panic!("expected block sent, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Response(response) => assert_eq!(response.code(), Code::CHANGED),
        other => panic!("expected response, got {:?}", other),
    }

    server.assert_quiet();
}

#[tokio::test(start_paused = true)]
async fn observe_delivers_notifications_until_cancelled() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.observe("coap://127.0.0.1/state").unwrap();

    let sent = server.expect_message().await;
    assert_eq!(sent.observe(), Some(0));

    let mut response = piggyback(&sent, Code::CONTENT, b"1");
    response.set_observe(1).unwrap();
    server.inject(&response);

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Response(response) => assert_eq!(response.payload(), b"1"),
        other => panic!("expected response, got {:?}", other),
    }

    // A non-confirmable notification two seconds later.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut notification = separate(
        sent.token(),
        MessageType::NonConfirmable,
        Code::CONTENT,
        0x900,
        b"2",
    );
    notification.set_observe(2).unwrap();
    server.inject(&notification);

    match next_event(&mut request).await {
        RequestEvent::Response(response) => assert_eq!(response.payload(), b"2"),
        other => panic!("expected response, got {:?}", other),
    }

    client.cancel(&request);
    match next_event(&mut request).await {
        RequestEvent::Cancelled => {}
        other => panic!("expected cancelled, got {:?}", other),
    }
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn observe_filters_late_notifications() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.observe("coap://127.0.0.1/state").unwrap();
    let sent = server.expect_message().await;

    let mut response = piggyback(&sent, Code::CONTENT, b"a");
    response.set_observe(10).unwrap();
    server.inject(&response);
    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Response(_) => {}
        other => panic!("expected response, got {:?}", other),
    }

    // A newer confirmable notification: acknowledged and delivered.
    let mut newer = separate(
        sent.token(),
        MessageType::Confirmable,
        Code::CONTENT,
        0x700,
        b"b",
    );
    newer.set_observe(12).unwrap();
    server.inject(&newer);

    let ack = server.expect_message().await;
    assert_eq!(ack.mtype(), MessageType::Acknowledgement);
    assert_eq!(ack.message_id(), 0x700);
    match next_event(&mut request).await {
        RequestEvent::Response(response) => assert_eq!(response.payload(), b"b"),
        other => panic!("expected response, got {:?}", other),
    }

    // An older one a second later: still acknowledged, never delivered.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut older = separate(
        sent.token(),
        MessageType::Confirmable,
        Code::CONTENT,
        0x701,
        b"stale",
    );
    older.set_observe(11).unwrap();
    server.inject(&older);

    let ack = server.expect_message().await;
    assert_eq!(ack.mtype(), MessageType::Acknowledgement);
    assert_eq!(ack.message_id(), 0x701);
    assert_no_event(&mut request).await;
}

#[tokio::test(start_paused = true)]
async fn observe_reregisters_after_max_age_expiry() {
    let (mut server, transport) = TestServer::new();
    let mut client = test_client(transport);
    let mut events = client.events().unwrap();

    let mut request = client.observe("coap://127.0.0.1/state").unwrap();
    let first = server.expect_message().await;

    let mut response = piggyback(&first, Code::CONTENT, b"1");
    response.set_observe(1).unwrap();
    response.set_max_age(5).unwrap();
    server.inject(&response);

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Response(_) => {}
        other => panic!("expected response, got {:?}", other),
    }
    let subscribed_at = Instant::now();

    // No further notifications: at Max-Age the client re-registers with a
    // fresh message ID and token, same path, Observe=0.
    let reissued = server.expect_message().await;
    assert_eq!(Instant::now() - subscribed_at, Duration::from_secs(5));
    assert_eq!(reissued.mtype(), MessageType::Confirmable);
    assert_eq!(reissued.code(), Code::GET);
    assert_eq!(reissued.uri_path(), "/state");
    assert_eq!(reissued.observe(), Some(0));
    assert_ne!(reissued.message_id(), first.message_id());
    assert_ne!(reissued.token(), first.token());

    // The old exchange's expiry was surfaced as a client event.
    let mut saw_exchange_timeout = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::ExchangeTimeout(_)) {
            saw_exchange_timeout = true;
        }
    }
    assert!(saw_exchange_timeout);

    // The handle keeps working across the re-registration.
    let mut response = piggyback(&reissued, Code::CONTENT, b"2");
    response.set_observe(2).unwrap();
    server.inject(&response);
    loop {
        match next_event(&mut request).await {
            RequestEvent::Acknowledged(_) => continue,
            RequestEvent::Response(response) => {
                assert_eq!(response.payload(), b"2");
                break;
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn separate_response_duplicate_replays_the_ack() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.get("coap://127.0.0.1/slow").unwrap();
    let sent = server.expect_message().await;

    // Server defers: empty ACK first, the response in its own CON later.
    let mut empty_ack = Message::new(MessageType::Acknowledgement, Code::EMPTY);
    empty_ack.header.message_id = sent.message_id();
    server.inject(&empty_ack);

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }

    let response = separate(
        sent.token(),
        MessageType::Confirmable,
        Code::CONTENT,
        0x800,
        b"done",
    );
    server.inject(&response);

    let ack = server.expect_message().await;
    assert_eq!(ack.mtype(), MessageType::Acknowledgement);
    assert_eq!(ack.message_id(), 0x800);
    match next_event(&mut request).await {
        RequestEvent::Response(response) => assert_eq!(response.payload(), b"done"),
        other => panic!("expected response, got {:?}", other),
    }

    // A retransmitted copy replays the identical ACK without a new event.
    server.inject(&response);
    let replayed = server.expect_message().await;
    assert_eq!(replayed.mtype(), MessageType::Acknowledgement);
    assert_eq!(replayed.message_id(), 0x800);
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn unsolicited_confirmable_response_is_reset() {
    let (mut server, transport) = TestServer::new();
    let _client = test_client(transport);

    let stray = separate(
        &[0xDE, 0xAD],
        MessageType::Confirmable,
        Code::CONTENT,
        0x123,
        b"?",
    );
    server.inject(&stray);

    let reset = server.expect_message().await;
    assert_eq!(reset.mtype(), MessageType::Reset);
    assert_eq!(reset.code(), Code::EMPTY);
    assert_eq!(reset.message_id(), 0x123);
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.get("coap://127.0.0.1/x").unwrap();
    let _sent = server.expect_message().await;

    client.cancel(&request);
    client.cancel(&request);

    match next_event(&mut request).await {
        RequestEvent::Cancelled => {}
        other => panic!("expected cancelled, got {:?}", other),
    }
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn non_confirmable_request_times_out_without_retransmission() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let start = Instant::now();
    let options = RequestOptions {
        non_confirmable: true,
        ..Default::default()
    };
    let mut request = client.get_with("coap://127.0.0.1/x", options).unwrap();

    let sent = server.expect_message().await;
    assert_eq!(sent.mtype(), MessageType::NonConfirmable);

    match next_event(&mut request).await {
        RequestEvent::Timeout => {}
        other => panic!("expected timeout, got {:?}", other),
    }
    // Exchange timeout, not the retransmission schedule:
    // ack_timeout * 2^(max_retransmit + 1) * ack_random_factor, with the
    // test's factor of 1.0.
    assert_eq!(Instant::now() - start, Duration::from_millis(64_000));
    server.assert_quiet();
}

#[tokio::test(start_paused = true)]
async fn error_notification_clears_the_subscription() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.observe("coap://127.0.0.1/state").unwrap();
    let sent = server.expect_message().await;

    let mut response = piggyback(&sent, Code::CONTENT, b"1");
    response.set_observe(1).unwrap();
    server.inject(&response);
    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Response(_) => {}
        other => panic!("expected response, got {:?}", other),
    }

    // The resource goes away; the error is delivered, then the
    // subscription dies.
    let gone = separate(
        sent.token(),
        MessageType::Confirmable,
        Code::NOT_FOUND,
        0x600,
        &[],
    );
    server.inject(&gone);

    let ack = server.expect_message().await;
    assert_eq!(ack.mtype(), MessageType::Acknowledgement);
    match next_event(&mut request).await {
        RequestEvent::Response(response) => assert_eq!(response.code(), Code::NOT_FOUND),
        other => panic!("expected response, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Cancelled => {}
        other => panic!("expected cancelled, got {:?}", other),
    }
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_by_reset() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.ping(server.endpoint()).unwrap();

    let ping = server.expect_message().await;
    assert_eq!(ping.mtype(), MessageType::Confirmable);
    assert_eq!(ping.code(), Code::EMPTY);
    assert!(ping.token().is_empty());

    let mut reset = Message::new(MessageType::Reset, Code::EMPTY);
    reset.header.message_id = ping.message_id();
    server.inject(&reset);

    match next_event(&mut request).await {
        RequestEvent::Reset(_) => {}
        other => panic!("expected reset, got {:?}", other),
    }
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_critical_option_is_a_protocol_error() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.get("coap://127.0.0.1/x").unwrap();
    let sent = server.expect_message().await;

    // Option 65 is unassigned and has the critical bit set; the response
    // cannot be handled faithfully and must not surface as a `Response`.
    let mut response = piggyback(&sent, Code::CONTENT, b"?");
    response
        .add_option(OptionNumber::Unknown(65), vec![0x01])
        .unwrap();
    server.inject(&response);

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Error(_) => {}
        other => panic!("expected error, got {:?}", other),
    }
    assert!(request.event().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_elective_option_is_retained() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let mut request = client.get("coap://127.0.0.1/x").unwrap();
    let sent = server.expect_message().await;

    // An elective (even) unknown option rides along untouched.
    let mut response = piggyback(&sent, Code::CONTENT, b"ok");
    response
        .add_option(OptionNumber::Unknown(2050), vec![0xAA])
        .unwrap();
    server.inject(&response);

    match next_event(&mut request).await {
        RequestEvent::Acknowledged(_) => {}
        other => panic!("expected acknowledged, got {:?}", other),
    }
    match next_event(&mut request).await {
        RequestEvent::Response(response) => {
            assert_eq!(response.payload(), b"ok");
            assert_eq!(
                response.first_option(OptionNumber::Unknown(2050)),
                Some(&[0xAA][..])
            );
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn tokens_differ_across_concurrent_requests() {
    let (mut server, transport) = TestServer::new();
    let client = test_client(transport);

    let _first = client.get("coap://127.0.0.1/a").unwrap();
    let _second = client.get("coap://127.0.0.1/b").unwrap();
    let _third = client.get("coap://127.0.0.1/c").unwrap();

    let a = server.expect_message().await;
    let b = server.expect_message().await;
    let c = server.expect_message().await;

    assert_ne!(a.token(), b.token());
    assert_ne!(b.token(), c.token());
    assert_ne!(a.token(), c.token());

    assert_ne!(a.message_id(), b.message_id());
    assert_ne!(b.message_id(), c.message_id());
}
