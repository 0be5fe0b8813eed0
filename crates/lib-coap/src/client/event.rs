use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    client::error::ClientError,
    types::{BlockOption, ExchangeKey, Message, TransactionKey},
};

/// Events delivered on a single request's handle, in causal order:
/// `Acknowledged` before `Response`, `BlockReceived` in block order, one
/// `Response` per completed body, terminal events exactly once.
#[derive(Debug)]
pub enum RequestEvent {
    /// The peer acknowledged our confirmable message. Carries the ACK, so a
    /// piggy-backed response payload is already visible here.
    Acknowledged(Message),

    /// The peer rejected the message with a reset.
    Reset(Message),

    /// A complete response body. For block-wise transfers this is the
    /// synthesized message carrying the reassembled payload; for
    /// subscriptions it fires once per accepted notification.
    Response(Message),

    /// One outgoing block of a block-wise upload was accepted.
    BlockSent(BlockOption),

    /// One incoming block of a block-wise download was accepted.
    BlockReceived(Message),

    /// The retransmission or exchange budget ran out.
    Timeout,

    /// The exchange was cancelled, explicitly or by observer replacement.
    Cancelled,

    /// A local failure, e.g. the datagram could not be sent.
    Error(ClientError),
}

/// Client-wide observability events.
#[derive(Debug)]
pub enum ClientEvent {
    MessageSent(Message),
    MessageReceived(Message),
    Error(ClientError),
    TransactionTimeout(TransactionKey),
    ExchangeTimeout(ExchangeKey),
}

/// Handle to an in-flight request: a stream of [`RequestEvent`]s plus the
/// identity [`crate::Client::cancel`] needs.
#[derive(Debug)]
pub struct RequestHandle {
    id: u64,
    events: UnboundedReceiver<RequestEvent>,
}

impl RequestHandle {
    pub(crate) fn new(id: u64, events: UnboundedReceiver<RequestEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The next event for this request, `None` once the exchange is finished
    /// and all events have been drained.
    pub async fn event(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }
}
