use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    client::driver::{Command, Driver},
    types::{Code, Endpoint, Message, MessageType},
};

mod config;
mod driver;
mod error;
mod event;
mod exchange;
mod timer;
mod token;
mod transaction;
mod transport;

pub use config::*;
pub use error::*;
pub use event::*;
pub use token::TokenError;
pub use transport::*;

/// Declarative construction of a [`Client`] with per-client parameter
/// overrides.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    params: TransmissionParameters,
}

impl ClientBuilder {
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.params.ack_timeout = ack_timeout;
        self
    }

    pub fn with_ack_random_factor(mut self, factor: f64) -> Self {
        self.params.ack_random_factor = factor;
        self
    }

    pub fn with_max_retransmit(mut self, max_retransmit: u32) -> Self {
        self.params.max_retransmit = max_retransmit;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.params.exchange_timeout = Some(timeout);
        self
    }

    pub fn with_duplicate_timeout(mut self, timeout: Duration) -> Self {
        self.params.duplicate_timeout = Some(timeout);
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.params.block_size = block_size;
        self
    }

    pub fn with_token_max_size(mut self, max_size: usize) -> Self {
        self.params.token_max_size = max_size;
        self
    }

    pub fn with_empty_token_safekeeping(mut self, safekeeping: Duration) -> Self {
        self.params.empty_token_safekeeping = safekeeping;
        self
    }

    /// Bind UDP sockets and start the client.
    pub async fn build(self) -> Result<Client, ClientError> {
        let transport = UdpTransport::bind().await?;
        Ok(self.build_with_transport(transport))
    }

    /// Start the client on a caller-provided [`Transport`]. Used by tests
    /// and alternative datagram stacks.
    pub fn build_with_transport<T: Transport + 'static>(self, transport: T) -> Client {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let driver = Driver::new(self.params, Arc::new(transport), command_rx, event_tx);
        tokio::spawn(driver.run());

        Client {
            commands,
            events: Some(events),
            next_request_id: AtomicU64::new(0),
        }
    }
}

/// A CoAP client over UDP.
///
/// This handle is cheap: all protocol state lives in a driver task that owns
/// the sockets, timers and registries. Each request returns a
/// [`RequestHandle`] delivering that request's events; client-wide events
/// are available once through [`Client::events`].
///
/// Dropping the client (or calling [`Client::destroy`]) stops the driver:
/// timers are abandoned, sockets closed, and no further events are emitted.
pub struct Client {
    commands: UnboundedSender<Command>,
    events: Option<UnboundedReceiver<ClientEvent>>,
    next_request_id: AtomicU64,
}

impl Client {
    /// Create a client with default parameters.
    pub async fn new() -> Result<Self, ClientError> {
        Self::builder().build().await
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// The client-wide event stream. Can be taken once.
    pub fn events(&mut self) -> Option<UnboundedReceiver<ClientEvent>> {
        self.events.take()
    }

    /// Issue a prepared request message. The message must carry a request
    /// code and a remote endpoint (set one with [`Message::set_uri`]).
    pub fn request(
        &self,
        message: Message,
        options: RequestOptions,
    ) -> Result<RequestHandle, ClientError> {
        if !message.code().is_request() {
            return Err(ClientError::NotARequest(message.code()));
        }
        self.submit(message, options)
    }

    /// GET the given URI.
    pub fn get(&self, uri: &str) -> Result<RequestHandle, ClientError> {
        self.get_with(uri, RequestOptions::default())
    }

    pub fn get_with(
        &self,
        uri: &str,
        options: RequestOptions,
    ) -> Result<RequestHandle, ClientError> {
        let mut message = Message::new(MessageType::Confirmable, Code::GET);
        message.set_uri(uri)?;
        self.request(message, options)
    }

    /// GET the given URI and subscribe to its changes. Notifications arrive
    /// as further `Response` events on the handle until it is cancelled, the
    /// server ends the observation, or an error response clears it.
    pub fn observe(&self, uri: &str) -> Result<RequestHandle, ClientError> {
        self.observe_with(uri, RequestOptions::default())
    }

    pub fn observe_with(
        &self,
        uri: &str,
        options: RequestOptions,
    ) -> Result<RequestHandle, ClientError> {
        let mut message = Message::new(MessageType::Confirmable, Code::GET);
        message.set_uri(uri)?;
        message.set_observe(0)?;
        self.request(message, options)
    }

    /// POST a payload to the given URI.
    pub fn post(&self, uri: &str, payload: Vec<u8>) -> Result<RequestHandle, ClientError> {
        self.send_with_payload(Code::POST, uri, payload, RequestOptions::default())
    }

    /// PUT a payload to the given URI. Bodies larger than the block size go
    /// out block-wise.
    pub fn put(&self, uri: &str, payload: Vec<u8>) -> Result<RequestHandle, ClientError> {
        self.send_with_payload(Code::PUT, uri, payload, RequestOptions::default())
    }

    /// DELETE the given URI.
    pub fn delete(&self, uri: &str) -> Result<RequestHandle, ClientError> {
        let mut message = Message::new(MessageType::Confirmable, Code::DELETE);
        message.set_uri(uri)?;
        self.request(message, RequestOptions::default())
    }

    fn send_with_payload(
        &self,
        code: Code,
        uri: &str,
        payload: Vec<u8>,
        options: RequestOptions,
    ) -> Result<RequestHandle, ClientError> {
        let mut message = Message::new(MessageType::Confirmable, code);
        message.set_uri(uri)?;
        message.set_payload(payload);
        self.request(message, options)
    }

    /// Probe a peer with a confirmable Empty message; a reachable CoAP
    /// endpoint answers with a reset, surfaced as a `Reset` event.
    pub fn ping(&self, endpoint: Endpoint) -> Result<RequestHandle, ClientError> {
        let mut message = Message::new(MessageType::Confirmable, Code::EMPTY);
        message.set_remote(endpoint);
        self.submit(message, RequestOptions::default())
    }

    /// Cancel a request. Idempotent; after the `Cancelled` event no further
    /// events are delivered for this handle.
    pub fn cancel(&self, request: &RequestHandle) {
        let _ = self.commands.send(Command::Cancel { id: request.id() });
    }

    /// Tear the client down: all timers are cancelled, sockets closed and
    /// tokens released. No events are emitted afterwards.
    pub fn destroy(&self) {
        let _ = self.commands.send(Command::Destroy);
    }

    fn submit(
        &self,
        message: Message,
        options: RequestOptions,
    ) -> Result<RequestHandle, ClientError> {
        if message.remote().is_none() {
            return Err(crate::types::MessageError::NoEndpoint.into());
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.commands
            .send(Command::Request {
                id,
                message,
                options,
                events: event_tx,
            })
            .map_err(|_| ClientError::Closed)?;

        Ok(RequestHandle::new(id, event_rx))
    }
}
