use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    time::{sleep_until, Instant},
};
use tracing::{debug, trace, warn};

use crate::{
    client::{
        config::{RequestOptions, TransmissionParameters},
        error::ClientError,
        event::{ClientEvent, RequestEvent},
        exchange::{Block1Cursor, Block2State, Exchange},
        timer::{TimerKind, TimerQueue},
        token::TokenManager,
        transaction::{initial_timeout, Transaction},
        transport::Transport,
    },
    constants::{DEFAULT_MAX_AGE, MAX_DATAGRAM_SIZE},
    types::{
        szx_for_size, BlockOption, Code, Endpoint, ExchangeKey, Message, MessageError, MessageKey,
        MessageType, OptionError, OptionNumber, TransactionKey,
    },
};

/// Instructions from the [`crate::Client`] handle to the driver task.
pub(crate) enum Command {
    Request {
        id: u64,
        message: Message,
        options: RequestOptions,
        events: UnboundedSender<RequestEvent>,
    },
    Cancel {
        id: u64,
    },
    Destroy,
}

/// The client coordinator. One task owns every piece of mutable state, so
/// transactions, exchanges, the observer index, the duplicate cache and all
/// timers mutate without locks; commands and datagrams are serialized by the
/// select loop.
pub(crate) struct Driver {
    params: TransmissionParameters,
    transport: Arc<dyn Transport>,
    commands: UnboundedReceiver<Command>,
    events: UnboundedSender<ClientEvent>,

    tokens: TokenManager,
    last_message_id: u16,

    transactions: HashMap<TransactionKey, Transaction>,
    exchanges: HashMap<ExchangeKey, Exchange>,
    /// Request-handle identity to exchange key; re-registration repoints it.
    requests: HashMap<u64, ExchangeKey>,
    /// Active subscriptions: endpoint, then Uri-Path.
    observers: HashMap<Endpoint, HashMap<String, ExchangeKey>>,
    /// Recently seen messages; the value addresses the cached reply.
    duplicates: HashMap<MessageKey, TransactionKey>,
    /// Replies (ACK/RST) this client sent, replayed for duplicates.
    replies: HashMap<TransactionKey, Vec<u8>>,
    timers: TimerQueue,
}

impl Driver {
    pub(crate) fn new(
        params: TransmissionParameters,
        transport: Arc<dyn Transport>,
        commands: UnboundedReceiver<Command>,
        events: UnboundedSender<ClientEvent>,
    ) -> Self {
        let tokens = TokenManager::new(params.token_max_size, params.empty_token_safekeeping);

        Self {
            params,
            transport,
            commands,
            events,
            tokens,
            last_message_id: 0,
            transactions: HashMap::new(),
            exchanges: HashMap::new(),
            requests: HashMap::new(),
            observers: HashMap::new(),
            duplicates: HashMap::new(),
            replies: HashMap::new(),
            timers: TimerQueue::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (timer_armed, deadline) = match self.timers.next_deadline() {
                Some(at) => (true, at),
                None => (false, Instant::now()),
            };
            let transport = Arc::clone(&self.transport);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request { id, message, options, events }) => {
                        self.handle_request(id, message, options, events).await;
                    }
                    Some(Command::Cancel { id }) => self.handle_cancel(id),
                    Some(Command::Destroy) | None => break,
                },
                received = transport.recv(&mut buf) => match received {
                    Ok((len, from)) => {
                        let datagram = buf[..len].to_vec();
                        self.handle_datagram(&datagram, from.into()).await;
                    }
                    Err(err) => {
                        warn!("transport receive failed: {}", err);
                        self.emit_client(ClientEvent::Error(err.into()));
                        break;
                    }
                },
                _ = sleep_until(deadline), if timer_armed => self.handle_timers().await,
            }
        }

        debug!("client driver stopped");
    }

    fn emit_client(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Message IDs wrap within 1..=0xFFFF; 0 is never handed out.
    fn next_message_id(&mut self) -> u16 {
        self.last_message_id = match self.last_message_id {
            u16::MAX => 1,
            id => id + 1,
        };
        self.last_message_id
    }

    // Outgoing path.

    async fn handle_request(
        &mut self,
        id: u64,
        mut message: Message,
        options: RequestOptions,
        events: UnboundedSender<RequestEvent>,
    ) {
        let code = message.code();
        let is_ping = code.is_empty();

        let Some(remote) = message.remote() else {
            let _ = events.send(RequestEvent::Error(MessageError::NoEndpoint.into()));
            return;
        };

        if options.non_confirmable {
            message.header.mtype = MessageType::NonConfirmable;
        }
        message.header.message_id = self.next_message_id();

        let token = if is_ping {
            // Pings probe reachability with the empty token; the RST answer
            // correlates by message ID alone.
            if let Err(err) = self
                .tokens
                .acquire_specific(&[], Instant::now().into_std())
            {
                let _ = events.send(RequestEvent::Error(err.into()));
                return;
            }
            Vec::new()
        } else {
            self.tokens.acquire()
        };

        if let Err(err) = message.set_token(token) {
            let _ = events.send(RequestEvent::Error(err.into()));
            return;
        }

        let key = ExchangeKey {
            endpoint: remote,
            token: message.token().to_vec(),
        };

        let block_size = options.block_size.unwrap_or(self.params.block_size);
        let exchange_timeout = options
            .exchange_timeout
            .unwrap_or_else(|| self.params.exchange_timeout());
        let max_retransmit = options.max_retransmit.unwrap_or(self.params.max_retransmit);

        // A caller-supplied Block2 requests one specific block and disables
        // reassembly; one we attach ourselves (early negotiation) does not.
        let auto_block2 = !message.has_option(OptionNumber::Block2);
        if code == Code::GET
            && auto_block2
            && (options.include_block2 || options.block_size.is_some())
        {
            if let Ok(block) = BlockOption::from_size(0, false, block_size) {
                // Block values stay within the option's length bounds.
                let _ = message.set_block2(block);
            }
        }

        let observer_eligible = code == Code::GET && message.has_option(OptionNumber::Observe);

        let mut exchange = Exchange {
            request_id: id,
            request: message.clone(),
            events,
            block_size,
            exchange_timeout,
            max_retransmit,
            transaction_key: None,
            timer: None,
            block1: None,
            block2: None,
            received_blocks: Vec::new(),
            auto_block2,
            observer_eligible,
            subscribed_path: None,
            last_observe: None,
            last_max_age: DEFAULT_MAX_AGE,
            server_initiative: false,
            acknowledged_emitted: false,
            timeout_emitted: false,
        };

        let timer = self.timers.schedule(
            Instant::now() + exchange_timeout,
            TimerKind::ExchangeTimeout(key.clone()),
        );
        exchange.timer = Some(timer);

        debug!("request {} starts exchange {}", id, key);
        self.requests.insert(id, key.clone());
        self.exchanges.insert(key.clone(), exchange);

        if !is_ping && message.payload().len() > block_size && message.block1().is_none() {
            if let Some(ex) = self.exchanges.get_mut(&key) {
                ex.block1 = Some(Block1Cursor {
                    num: -1,
                    szx: szx_for_size(block_size),
                });
            }
            self.send_next_block1(&key).await;
        } else {
            self.send_exchange_message(&key, message).await;
        }
    }

    /// Encode and send a message belonging to an exchange, creating the
    /// retransmission transaction for confirmables. Send failures become a
    /// deferred `Error` on the request; the exchange then runs into its
    /// timeout.
    async fn send_exchange_message(&mut self, key: &ExchangeKey, message: Message) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail_exchange_send(key, err.into());
                return;
            }
        };

        if let Err(err) = self.transport.send(&bytes, key.endpoint.socket_addr()).await {
            self.fail_exchange_send(key, err.into());
            return;
        }

        trace!("sent {} to {}", message, key.endpoint);
        self.emit_client(ClientEvent::MessageSent(message.clone()));

        if message.mtype().is_confirmable() {
            let transaction_key = TransactionKey {
                endpoint: key.endpoint,
                message_id: message.message_id(),
            };
            let max_retransmit = self
                .exchanges
                .get(key)
                .map(|ex| ex.max_retransmit)
                .unwrap_or(self.params.max_retransmit);
            let current_timeout =
                initial_timeout(self.params.ack_timeout, self.params.ack_random_factor);
            let timer = self.timers.schedule(
                Instant::now() + current_timeout,
                TimerKind::Retransmit(transaction_key),
            );

            self.transactions.insert(
                transaction_key,
                Transaction {
                    key: transaction_key,
                    exchange_key: key.clone(),
                    message,
                    bytes,
                    retries: 0,
                    max_retransmit,
                    current_timeout,
                    timer: Some(timer),
                },
            );
            if let Some(ex) = self.exchanges.get_mut(key) {
                ex.transaction_key = Some(transaction_key);
            }
        }
    }

    fn fail_exchange_send(&mut self, key: &ExchangeKey, err: ClientError) {
        warn!("send on {} failed: {}", key, err);
        if let Some(ex) = self.exchanges.get(key) {
            ex.emit(RequestEvent::Error(err));
        }
    }

    /// Compose and send the next block of an outgoing body: the parent's
    /// options and token, a fresh message ID, the advanced Block1 and the
    /// matching payload slice.
    async fn send_next_block1(&mut self, key: &ExchangeKey) {
        let (request, num, szx, size, total) = {
            let Some(ex) = self.exchanges.get_mut(key) else {
                return;
            };
            let request = ex.request.clone();
            let Some(cursor) = ex.block1.as_mut() else {
                return;
            };
            cursor.num += 1;
            let total = cursor.total_blocks(request.payload().len());
            (request, cursor.num, cursor.szx, cursor.size(), total)
        };

        let start = num as usize * size;
        let end = usize::min(start + size, request.payload().len());
        let more = num + 1 < total;

        let Ok(block) = BlockOption::new(num as u32, more, szx) else {
            return;
        };

        let mut block_message = request.clone();
        block_message.header.mtype = MessageType::Confirmable;
        block_message.header.message_id = self.next_message_id();
        if block_message.set_block1(block).is_err() {
            return;
        }
        block_message.set_payload(request.payload()[start..end].to_vec());

        self.send_exchange_message(key, block_message).await;
    }

    /// Fetch the block after `previous` of a response body: the parent's
    /// options and token with a fresh message ID, no payload and no Observe
    /// (block fetches never re-register).
    async fn request_next_block2(&mut self, key: &ExchangeKey, previous: &BlockOption) {
        let request = match self.exchanges.get(key) {
            Some(ex) => ex.request.clone(),
            None => return,
        };

        let Ok(block) = BlockOption::new(previous.num + 1, false, previous.szx) else {
            return;
        };

        let mut next = request;
        next.header.mtype = MessageType::Confirmable;
        next.header.message_id = self.next_message_id();
        next.remove_observe();
        next.set_payload(Vec::new());
        if next.set_block2(block).is_err() {
            return;
        }

        self.send_exchange_message(key, next).await;
    }

    // Incoming path.

    async fn handle_datagram(&mut self, data: &[u8], from: Endpoint) {
        let mut message = match Message::from_bytes(data) {
            Ok(message) => message,
            Err(err) => {
                debug!("dropping malformed datagram from {}: {}", from, err);
                self.emit_client(ClientEvent::Error(err.into()));
                return;
            }
        };

        let now = Instant::now();
        message.set_remote(from);
        message.stamp_received(now.into_std());
        trace!("received {} from {}", message, from);
        self.emit_client(ClientEvent::MessageReceived(message.clone()));

        let Some(message_key) = message.message_key() else {
            return;
        };
        if let Some(reply_key) = self.duplicates.get(&message_key) {
            debug!("duplicate {}; replaying cached reply", message_key);
            if let Some(bytes) = self.replies.get(reply_key).cloned() {
                let _ = self.transport.send(&bytes, from.socket_addr()).await;
            }
            return;
        }
        self.duplicates.insert(
            message_key,
            TransactionKey {
                endpoint: from,
                message_id: message.message_id(),
            },
        );
        self.timers.schedule(
            now + self.params.duplicate_timeout(),
            TimerKind::DuplicateExpiry(message_key),
        );

        // This is a client: stray requests get a reset (CON) or silence.
        if message.code().is_request() {
            debug!("unsolicited request from {}", from);
            if message.mtype().is_confirmable() {
                self.send_reply(reset_for(&message), &message).await;
            }
            return;
        }

        match (message.mtype(), message.code().is_empty()) {
            (MessageType::Reset, _) => {
                self.handle_reset(&message);
                return;
            }
            (MessageType::Acknowledgement, true) => {
                self.handle_empty_ack(&message);
                return;
            }
            _ => {}
        }

        let key = ExchangeKey {
            endpoint: from,
            token: message.token().to_vec(),
        };
        if !self.exchanges.contains_key(&key) {
            debug!("no exchange for {}", key);
            if message.mtype().is_confirmable() {
                self.send_reply(reset_for(&message), &message).await;
            }
            return;
        }

        self.handle_exchange_message(key, message, now).await;
    }

    /// A reset rejects the referenced transaction and tears down its
    /// exchange.
    fn handle_reset(&mut self, message: &Message) {
        let Some(transaction_key) = message.transaction_key() else {
            return;
        };
        let Some(transaction) = self.transactions.remove(&transaction_key) else {
            debug!("reset for unknown transaction {}", transaction_key);
            return;
        };
        if let Some(timer) = transaction.timer {
            self.timers.cancel(timer);
        }

        let key = transaction.exchange_key;
        self.finish_exchange(&key, Some(RequestEvent::Reset(message.clone())));
    }

    /// An empty ACK accepts the transaction but leaves the exchange alive;
    /// the actual response arrives separately.
    fn handle_empty_ack(&mut self, message: &Message) {
        let Some(transaction_key) = message.transaction_key() else {
            return;
        };
        let Some(transaction) = self.transactions.remove(&transaction_key) else {
            return;
        };
        if let Some(timer) = transaction.timer {
            self.timers.cancel(timer);
        }

        if let Some(ex) = self.exchanges.get_mut(&transaction.exchange_key) {
            ex.transaction_key = None;
            if !ex.acknowledged_emitted {
                ex.acknowledged_emitted = true;
                ex.emit(RequestEvent::Acknowledged(message.clone()));
            }
        }
    }

    async fn handle_exchange_message(&mut self, key: ExchangeKey, message: Message, now: Instant) {
        // Close out the matching transaction: by the message's own key for
        // ACKs, by the exchange's outstanding one for separate responses
        // (the request evidently arrived).
        let closed_key = if message.mtype() == MessageType::Acknowledgement {
            message.transaction_key()
        } else {
            self.exchanges.get(&key).and_then(|ex| ex.transaction_key)
        };
        if let Some(transaction_key) = closed_key {
            if let Some(transaction) = self.transactions.remove(&transaction_key) {
                if let Some(timer) = transaction.timer {
                    self.timers.cancel(timer);
                }
            }
        }
        if let Some(ex) = self.exchanges.get_mut(&key) {
            ex.transaction_key = None;

            if message.mtype() == MessageType::Acknowledgement && !ex.acknowledged_emitted {
                ex.acknowledged_emitted = true;
                ex.emit(RequestEvent::Acknowledged(message.clone()));
            }
        }

        // An unknown option the peer marked critical would change how the
        // response must be handled; reject the message instead of guessing.
        if let Some(number) = message.unknown_critical_option() {
            warn!("unknown critical option {} on {}", number, key);
            if message.mtype().is_confirmable() {
                self.send_reply(reset_for(&message), &message).await;
            }
            self.finish_exchange(
                &key,
                Some(RequestEvent::Error(
                    MessageError::UnknownCriticalOption(number).into(),
                )),
            );
            return;
        }

        // Late notifications are confirmed but not delivered. Blocks of an
        // in-progress body repeat the first block's Observe value; ordering
        // is the block validator's business then.
        if let Some(observe) = message.observe() {
            let newer = self
                .exchanges
                .get(&key)
                .map(|ex| ex.block2.is_some() || ex.is_newer_notification(observe, now))
                .unwrap_or(true);
            if !newer {
                debug!("late notification (observe {}) on {}", observe, key);
                if message.mtype().is_confirmable() {
                    self.send_reply(ack_for(&message), &message).await;
                }
                return;
            }
        }

        let observer_error = self.update_observer_state(&key, &message);

        let has_block1_cursor = self
            .exchanges
            .get(&key)
            .map(|ex| ex.block1.is_some())
            .unwrap_or(false);
        let auto_block2 = self
            .exchanges
            .get(&key)
            .map(|ex| ex.auto_block2)
            .unwrap_or(false);

        match (has_block1_cursor, message.block1(), message.block2()) {
            (true, Some(Ok(block)), _) => {
                self.handle_block1_response(&key, message, block, now, observer_error)
                    .await;
            }
            (_, _, Some(result)) if auto_block2 => {
                self.handle_block2_response(&key, message, result, now, observer_error)
                    .await;
            }
            _ => {
                self.handle_simple_response(&key, message, now, observer_error)
                    .await;
            }
        }
    }

    /// Observer index bookkeeping for responses on an observer-eligible
    /// exchange. Returns true when the response is an error that must tear
    /// the subscription down after delivery.
    fn update_observer_state(&mut self, key: &ExchangeKey, message: &Message) -> bool {
        let (eligible, subscribed_path, request_path) = match self.exchanges.get(key) {
            Some(ex) => (
                ex.observer_eligible,
                ex.subscribed_path.clone(),
                ex.request.uri_path(),
            ),
            None => return false,
        };
        if !eligible {
            return false;
        }

        let code = message.code();
        if code.is_success() {
            if message.observe().is_some() {
                if subscribed_path.is_none() {
                    // First success with Observe establishes the
                    // subscription, displacing any previous observer of the
                    // same resource.
                    let previous = self
                        .observers
                        .entry(key.endpoint)
                        .or_default()
                        .insert(request_path.clone(), key.clone());
                    if let Some(previous_key) = previous {
                        if previous_key != *key {
                            debug!(
                                "observer for {} {} replaced by {}",
                                key.endpoint, request_path, key
                            );
                            self.finish_exchange(&previous_key, Some(RequestEvent::Cancelled));
                        }
                    }
                    if let Some(ex) = self.exchanges.get_mut(key) {
                        ex.subscribed_path = Some(request_path);
                    }
                }
            } else if let Some(path) = subscribed_path {
                // A success without Observe ends the observation.
                debug!("observation on {} ended by the server", key);
                self.remove_observer(key.endpoint, &path, key);
                if let Some(ex) = self.exchanges.get_mut(key) {
                    ex.subscribed_path = None;
                }
            }
            false
        } else if code.is_error() {
            match subscribed_path {
                Some(path) => {
                    self.remove_observer(key.endpoint, &path, key);
                    if let Some(ex) = self.exchanges.get_mut(key) {
                        ex.subscribed_path = None;
                    }
                    true
                }
                None => false,
            }
        } else {
            false
        }
    }

    fn remove_observer(&mut self, endpoint: Endpoint, path: &str, key: &ExchangeKey) {
        if let Some(paths) = self.observers.get_mut(&endpoint) {
            if paths.get(path) == Some(key) {
                paths.remove(path);
            }
            if paths.is_empty() {
                self.observers.remove(&endpoint);
            }
        }
    }

    async fn handle_simple_response(
        &mut self,
        key: &ExchangeKey,
        message: Message,
        now: Instant,
        observer_error: bool,
    ) {
        // Separate confirmable responses are acknowledged (and the ACK
        // cached for duplicates).
        if message.mtype().is_confirmable() {
            self.send_reply(ack_for(&message), &message).await;
        }

        self.note_accepted(key, &message, now);

        let Some(ex) = self.exchanges.get(key) else {
            return;
        };
        ex.emit(RequestEvent::Response(message));

        if observer_error {
            self.finish_exchange(key, Some(RequestEvent::Cancelled));
            return;
        }

        let subscribed = self
            .exchanges
            .get(key)
            .map(|ex| ex.is_subscribed())
            .unwrap_or(false);
        if subscribed {
            self.rearm_exchange_timer(key, now);
        } else {
            self.finish_exchange(key, None);
        }
    }

    async fn handle_block1_response(
        &mut self,
        key: &ExchangeKey,
        message: Message,
        block: BlockOption,
        now: Instant,
        observer_error: bool,
    ) {
        let (num, szx) = match self.exchanges.get(key).and_then(|ex| ex.block1.as_ref()) {
            Some(cursor) => (cursor.num, cursor.szx),
            None => return,
        };

        // The server must confirm the block we sent, at our size or smaller.
        // Anything else stalls the exchange into its timeout.
        if i64::from(block.num) != num || block.szx > szx {
            warn!("unexpected Block1 {} on {} (cursor at {})", block, key, num);
            return;
        }

        if block.szx < szx {
            if let Some(cursor) = self.exchanges.get_mut(key).and_then(|ex| ex.block1.as_mut()) {
                cursor.renegotiate(block.szx);
            }
        }

        self.note_accepted(key, &message, now);
        self.rearm_exchange_timer(key, now);

        if let Some(ex) = self.exchanges.get(key) {
            ex.emit(RequestEvent::BlockSent(block));
        }

        let done = match self.exchanges.get(key) {
            Some(ex) => match ex.block1.as_ref() {
                Some(cursor) => {
                    cursor.num + 1 >= cursor.total_blocks(ex.request.payload().len())
                }
                None => true,
            },
            None => return,
        };

        if !done {
            self.send_next_block1(key).await;
            return;
        }

        // Body fully uploaded. The final ACK either carries the response
        // itself or switches the exchange to a block-wise download.
        if let Some(ex) = self.exchanges.get_mut(key) {
            ex.block1 = None;
        }

        let auto_block2 = self
            .exchanges
            .get(key)
            .map(|ex| ex.auto_block2)
            .unwrap_or(false);
        match message.block2() {
            Some(result) if auto_block2 => {
                self.handle_block2_response(key, message, result, now, observer_error)
                    .await;
            }
            _ => {
                self.handle_simple_response(key, message, now, observer_error)
                    .await;
            }
        }
    }

    async fn handle_block2_response(
        &mut self,
        key: &ExchangeKey,
        message: Message,
        result: Result<BlockOption, OptionError>,
        now: Instant,
        observer_error: bool,
    ) {
        let accepted = match result {
            Ok(block) => {
                let acceptable = self
                    .exchanges
                    .get(key)
                    .map(|ex| ex.accepts_block2(&block, message.observe()))
                    .unwrap_or(false);
                acceptable.then_some(block)
            }
            Err(_) => None,
        };

        let Some(block) = accepted else {
            // Invalid block. Confirmables with Observe are acknowledged so
            // the server stops retransmitting, plain confirmables are
            // reset, everything else is ignored; the exchange then runs
            // into its timeout.
            warn!("ignoring invalid block on {}", key);
            if message.mtype().is_confirmable() {
                if message.observe().is_some() {
                    self.send_reply(ack_for(&message), &message).await;
                } else {
                    self.send_reply(reset_for(&message), &message).await;
                }
            }
            return;
        };

        if let Some(ex) = self.exchanges.get_mut(key) {
            let observe = match &ex.block2 {
                None => {
                    // The first block decides who drives the transfer: a
                    // pushed (non-ACK) block means the server keeps sending
                    // without being asked.
                    ex.server_initiative = message.mtype() != MessageType::Acknowledgement;
                    message.observe()
                }
                Some(state) => state.observe,
            };
            ex.block2 = Some(Block2State {
                num: block.num,
                szx: block.szx,
                observe,
            });
            ex.received_blocks.push(message.clone());
            ex.emit(RequestEvent::BlockReceived(message.clone()));
        }

        self.note_accepted(key, &message, now);
        self.rearm_exchange_timer(key, now);

        if message.mtype().is_confirmable() {
            self.send_reply(ack_for(&message), &message).await;
        }

        if block.more {
            let server_driven = self
                .exchanges
                .get(key)
                .map(|ex| ex.server_initiative)
                .unwrap_or(false);
            if !server_driven {
                self.request_next_block2(key, &block).await;
            }
            return;
        }

        // Last block: synthesize the response from the final block message
        // and the concatenated body.
        let (synthetic, subscribed) = {
            let Some(ex) = self.exchanges.get_mut(key) else {
                return;
            };
            let Some(last) = ex.received_blocks.last() else {
                return;
            };
            let mut synthetic = last.clone();
            let body: Vec<u8> = ex
                .received_blocks
                .iter()
                .flat_map(|block_message| block_message.payload().iter().copied())
                .collect();
            synthetic.set_payload(body);

            ex.block2 = None;
            ex.received_blocks.clear();
            (synthetic, ex.is_subscribed())
        };

        if let Some(ex) = self.exchanges.get(key) {
            ex.emit(RequestEvent::Response(synthetic));
        }

        if observer_error {
            self.finish_exchange(key, Some(RequestEvent::Cancelled));
        } else if !subscribed {
            self.finish_exchange(key, None);
        }
    }

    fn note_accepted(&mut self, key: &ExchangeKey, message: &Message, now: Instant) {
        if let Some(ex) = self.exchanges.get_mut(key) {
            ex.note_response(message, now);
        }
    }

    /// Progress re-arms the exchange timer; an established subscription uses
    /// the server's freshness horizon so a missed notification triggers
    /// re-registration.
    fn rearm_exchange_timer(&mut self, key: &ExchangeKey, now: Instant) {
        let (old_timer, duration) = match self.exchanges.get_mut(key) {
            Some(ex) => {
                let duration = if ex.is_subscribed() {
                    ex.max_age()
                } else {
                    ex.exchange_timeout
                };
                (ex.timer.take(), duration)
            }
            None => return,
        };

        if let Some(timer) = old_timer {
            self.timers.cancel(timer);
        }
        let timer = self
            .timers
            .schedule(now + duration, TimerKind::ExchangeTimeout(key.clone()));
        if let Some(ex) = self.exchanges.get_mut(key) {
            ex.timer = Some(timer);
        }
    }

    /// Send an ACK or RST answering a server message and cache it for
    /// duplicate replay.
    async fn send_reply(&mut self, reply: Message, original: &Message) {
        let Some(remote) = original.remote() else {
            return;
        };
        let Ok(bytes) = reply.to_bytes() else {
            return;
        };

        if let Err(err) = self.transport.send(&bytes, remote.socket_addr()).await {
            warn!("sending {} to {} failed: {}", reply, remote, err);
            return;
        }

        self.emit_client(ClientEvent::MessageSent(reply));
        if let Some(transaction_key) = original.transaction_key() {
            self.replies.insert(transaction_key, bytes);
        }
    }

    // Timers.

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        while let Some(kind) = self.timers.pop_due(now) {
            match kind {
                TimerKind::Retransmit(transaction_key) => {
                    self.handle_retransmit(transaction_key, now).await;
                }
                TimerKind::ExchangeTimeout(key) => {
                    self.handle_exchange_timeout(key, now).await;
                }
                TimerKind::DuplicateExpiry(message_key) => {
                    if let Some(reply_key) = self.duplicates.remove(&message_key) {
                        self.replies.remove(&reply_key);
                    }
                }
            }
        }
    }

    async fn handle_retransmit(&mut self, transaction_key: TransactionKey, now: Instant) {
        let pending = {
            let Some(transaction) = self.transactions.get_mut(&transaction_key) else {
                return;
            };
            transaction.retries += 1;
            if transaction.can_retry() {
                transaction.current_timeout *= 2;
                Some((
                    transaction.bytes.clone(),
                    transaction.message.clone(),
                    transaction.current_timeout,
                    transaction.key.endpoint,
                ))
            } else {
                None
            }
        };

        match pending {
            Some((bytes, message, timeout, endpoint)) => {
                trace!("retransmitting {}", transaction_key);
                match self.transport.send(&bytes, endpoint.socket_addr()).await {
                    Ok(_) => self.emit_client(ClientEvent::MessageSent(message)),
                    Err(err) => warn!("retransmission of {} failed: {}", transaction_key, err),
                }

                let timer = self
                    .timers
                    .schedule(now + timeout, TimerKind::Retransmit(transaction_key));
                if let Some(transaction) = self.transactions.get_mut(&transaction_key) {
                    transaction.timer = Some(timer);
                }
            }
            None => {
                let Some(transaction) = self.transactions.remove(&transaction_key) else {
                    return;
                };
                debug!("retransmission budget exhausted for {}", transaction_key);
                self.emit_client(ClientEvent::TransactionTimeout(transaction_key));

                let key = transaction.exchange_key;
                let emit_timeout = match self.exchanges.get_mut(&key) {
                    Some(ex) if !ex.timeout_emitted => {
                        ex.timeout_emitted = true;
                        true
                    }
                    _ => false,
                };
                self.finish_exchange(&key, emit_timeout.then_some(RequestEvent::Timeout));
            }
        }
    }

    async fn handle_exchange_timeout(&mut self, key: ExchangeKey, now: Instant) {
        let subscribed = match self.exchanges.get(&key) {
            Some(ex) => ex.is_subscribed(),
            None => return,
        };

        self.emit_client(ClientEvent::ExchangeTimeout(key.clone()));

        if subscribed {
            self.reregister_observer(key, now).await;
        } else {
            let emit_timeout = match self.exchanges.get_mut(&key) {
                Some(ex) if !ex.timeout_emitted => {
                    ex.timeout_emitted = true;
                    true
                }
                _ => false,
            };
            self.finish_exchange(&key, emit_timeout.then_some(RequestEvent::Timeout));
        }
    }

    /// A subscription missed its notification window: reissue the original
    /// request with a fresh message ID and token, keeping the handle and its
    /// event stream.
    async fn reregister_observer(&mut self, old_key: ExchangeKey, now: Instant) {
        let Some(mut ex) = self.exchanges.remove(&old_key) else {
            return;
        };
        debug!("re-registering observer {} after missed notification", old_key);

        if let Some(timer) = ex.timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(transaction_key) = ex.transaction_key.take() {
            if let Some(transaction) = self.transactions.remove(&transaction_key) {
                if let Some(timer) = transaction.timer {
                    self.timers.cancel(timer);
                }
            }
        }
        if let Some(path) = ex.subscribed_path.take() {
            self.remove_observer(old_key.endpoint, &path, &old_key);
        }
        self.tokens.release(&old_key.token, now.into_std());

        let mut request = ex.request.clone();
        request.header.message_id = self.next_message_id();
        if request.set_token(self.tokens.acquire()).is_err() {
            return;
        }
        let new_key = ExchangeKey {
            endpoint: old_key.endpoint,
            token: request.token().to_vec(),
        };

        ex.request = request.clone();
        ex.block1 = None;
        ex.block2 = None;
        ex.received_blocks.clear();
        ex.last_observe = None;
        ex.server_initiative = false;
        ex.acknowledged_emitted = false;
        let timer = self.timers.schedule(
            now + ex.exchange_timeout,
            TimerKind::ExchangeTimeout(new_key.clone()),
        );
        ex.timer = Some(timer);

        self.requests.insert(ex.request_id, new_key.clone());
        self.exchanges.insert(new_key.clone(), ex);
        self.send_exchange_message(&new_key, request).await;
    }

    // Teardown.

    fn handle_cancel(&mut self, id: u64) {
        // Idempotent: a finished or already-cancelled request has no entry.
        let Some(key) = self.requests.get(&id).cloned() else {
            return;
        };
        debug!("cancelling request {} ({})", id, key);
        self.finish_exchange(&key, Some(RequestEvent::Cancelled));
    }

    /// Remove an exchange and everything hanging off it: its timers, its
    /// outstanding transaction, its observer entry and its token. The final
    /// event, if any, is the last this request will ever see.
    fn finish_exchange(&mut self, key: &ExchangeKey, final_event: Option<RequestEvent>) {
        let Some(mut ex) = self.exchanges.remove(key) else {
            return;
        };

        if let Some(timer) = ex.timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(transaction_key) = ex.transaction_key.take() {
            if let Some(transaction) = self.transactions.remove(&transaction_key) {
                if let Some(timer) = transaction.timer {
                    self.timers.cancel(timer);
                }
            }
        }
        if let Some(path) = ex.subscribed_path.take() {
            self.remove_observer(key.endpoint, &path, key);
        }
        if self.requests.get(&ex.request_id) == Some(key) {
            self.requests.remove(&ex.request_id);
        }
        self.tokens.release(&key.token, Instant::now().into_std());

        if let Some(event) = final_event {
            ex.emit(event);
        }
    }
}

/// Empty ACK confirming a confirmable server message.
fn ack_for(message: &Message) -> Message {
    let mut ack = Message::new(MessageType::Acknowledgement, Code::EMPTY);
    ack.header.message_id = message.message_id();
    if let Some(remote) = message.remote() {
        ack.set_remote(remote);
    }
    ack
}

/// Reset rejecting a server message.
fn reset_for(message: &Message) -> Message {
    let mut reset = Message::new(MessageType::Reset, Code::EMPTY);
    reset.header.message_id = message.message_id();
    if let Some(remote) = message.remote() {
        reset.set_remote(remote);
    }
    reset
}
