use std::time::Duration;

use tokio::{sync::mpsc::UnboundedSender, time::Instant};

use crate::{
    client::{event::RequestEvent, timer::TimerId},
    constants::{DEFAULT_MAX_AGE, OBSERVE_REORDER_WINDOW, OBSERVE_WRAP_THRESHOLD},
    types::{BlockOption, Message, TransactionKey},
};

/// Cursor of an outgoing block-wise body. `num` is the block most recently
/// put on the wire; -1 before the first block is sent.
#[derive(Debug)]
pub(crate) struct Block1Cursor {
    pub num: i64,
    pub szx: u8,
}

impl Block1Cursor {
    pub fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    /// Blocks the body splits into at the current size.
    pub fn total_blocks(&self, body_len: usize) -> i64 {
        (body_len.div_ceil(self.size())).max(1) as i64
    }

    /// Adopt a smaller block size negotiated by the server, repositioning
    /// the cursor so no byte already acknowledged is sent again:
    /// `num = ceil((num + 1) * old / new) - 1`.
    pub fn renegotiate(&mut self, szx: u8) {
        let old_size = self.size() as i64;
        self.szx = szx;
        let new_size = self.size() as i64;

        let dividend = (self.num + 1) * old_size;
        let d = dividend / new_size;
        let r = dividend % new_size;
        let div_ceil = if (r > 0 && new_size > 0) || (r < 0 && new_size < 0) {
            d + 1
        } else {
            d
        };
        self.num = div_ceil - 1;
    }
}

/// Progress of an incoming block-wise body: the most recently accepted
/// block and, for observer-driven bodies, the Observe value the body
/// started with.
#[derive(Debug)]
pub(crate) struct Block2State {
    pub num: u32,
    pub szx: u8,
    pub observe: Option<u32>,
}

/// One logical operation against a resource, keyed by (endpoint, token):
/// the original request plus all responses, block follow-ups and
/// notifications that flow under that token.
#[derive(Debug)]
pub(crate) struct Exchange {
    /// Identity of the user-facing request handle.
    pub request_id: u64,

    /// The original request as the user handed it over (with the assigned
    /// message ID and token). Re-registration reissues it.
    pub request: Message,

    pub events: UnboundedSender<RequestEvent>,

    pub block_size: usize,
    pub exchange_timeout: Duration,
    pub max_retransmit: u32,

    /// The currently outstanding transaction, if any.
    pub transaction_key: Option<TransactionKey>,
    pub timer: Option<TimerId>,

    pub block1: Option<Block1Cursor>,
    pub block2: Option<Block2State>,
    pub received_blocks: Vec<Message>,

    /// Whether a Block2 response may be reassembled automatically. False
    /// when the caller put their own Block2 on the request.
    pub auto_block2: bool,

    /// A GET carrying Observe may become a subscription.
    pub observer_eligible: bool,

    /// The Uri-Path this exchange is registered under in the observer
    /// index, once a subscription is established.
    pub subscribed_path: Option<String>,

    /// Sequence number and arrival time of the newest accepted
    /// notification.
    pub last_observe: Option<(u32, Instant)>,

    /// Max-Age of the newest accepted response, re-arming the exchange
    /// timer while subscribed.
    pub last_max_age: u32,

    /// The server pushes follow-up blocks on its own instead of waiting
    /// for block requests.
    pub server_initiative: bool,

    pub acknowledged_emitted: bool,
    pub timeout_emitted: bool,
}

impl Exchange {
    pub fn emit(&self, event: RequestEvent) {
        // The handle may have been dropped; events then just vanish.
        let _ = self.events.send(event);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed_path.is_some()
    }

    /// Max-Age of the newest response as a timer duration.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.last_max_age))
    }

    /// Whether a notification carrying sequence `value` at `received` is
    /// newer than the newest one seen, see [`observe_is_newer`].
    pub fn is_newer_notification(&self, value: u32, received: Instant) -> bool {
        match self.last_observe {
            Some(last) => observe_is_newer(last, value, received),
            None => true,
        }
    }

    /// Record an accepted response's observe/freshness state.
    pub fn note_response(&mut self, message: &Message, received: Instant) {
        if let Some(value) = message.observe() {
            self.last_observe = Some((value, received));
        }
        self.last_max_age = message.max_age().unwrap_or(DEFAULT_MAX_AGE);
    }

    /// Validate an incoming block against the reassembly state: the first
    /// block must be block 0, followers must be exactly the next number at
    /// the same or a smaller size, observer-driven bodies must stay within
    /// one notification, and the block must fit the configured size.
    pub fn accepts_block2(&self, block: &BlockOption, observe: Option<u32>) -> bool {
        if block.size() > self.block_size {
            return false;
        }

        match &self.block2 {
            None => block.num == 0,
            Some(state) => {
                block.num == state.num + 1
                    && block.szx <= state.szx
                    && (state.observe.is_none() || state.observe == observe)
            }
        }
    }
}

/// Observe ordering: sequence numbers advance within a 24-bit space, so a
/// larger value within half that range, or a smaller one more than half the
/// range away (wrap-around), is newer. Anything else is a late notification,
/// unless the newest one has aged past the reorder window.
pub(crate) fn observe_is_newer(
    (last_value, last_received): (u32, Instant),
    value: u32,
    received: Instant,
) -> bool {
    (last_value < value && value - last_value < OBSERVE_WRAP_THRESHOLD)
        || (last_value > value && last_value - value > OBSERVE_WRAP_THRESHOLD)
        || received > last_received + OBSERVE_REORDER_WINDOW
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block1_total_and_size() {
        let cursor = Block1Cursor { num: -1, szx: 3 };
        assert_eq!(cursor.size(), 128);
        assert_eq!(cursor.total_blocks(319), 3);
        assert_eq!(cursor.total_blocks(256), 2);
        assert_eq!(cursor.total_blocks(0), 1);
    }

    #[test]
    fn block1_renegotiation_repositions_the_cursor() {
        // Block 0 of 128 bytes was acknowledged at size 64: the first two
        // 64-byte blocks are covered, the cursor must sit on block 1.
        let mut cursor = Block1Cursor { num: 0, szx: 3 };
        cursor.renegotiate(2);
        assert_eq!(cursor.num, 1);
        assert_eq!(cursor.size(), 64);

        // Unchanged size keeps the position.
        let mut cursor = Block1Cursor { num: 2, szx: 2 };
        cursor.renegotiate(2);
        assert_eq!(cursor.num, 2);
    }

    #[test]
    fn observe_ordering() {
        let t0 = Instant::now();
        let soon = t0 + Duration::from_secs(1);

        // Plain forward progress.
        assert!(observe_is_newer((10, t0), 12, soon));
        // Going backwards is late.
        assert!(!observe_is_newer((12, t0), 11, soon));
        // Repeating the same sequence number is late.
        assert!(!observe_is_newer((12, t0), 12, soon));
        // A huge forward jump is a wrapped (old) value.
        assert!(!observe_is_newer((10, t0), 10 + (1 << 23), soon));
        // A huge backward jump is a wrap-around, hence newer.
        assert!(observe_is_newer(((1 << 24) - 1, t0), 1, soon));
    }

    #[test]
    fn stale_state_accepts_anything_after_the_reorder_window() {
        let t0 = Instant::now();
        let late = t0 + Duration::from_millis(128_001);

        assert!(observe_is_newer((12, t0), 5, late));
        assert!(!observe_is_newer((12, t0), 5, t0 + Duration::from_millis(128_000)));
    }
}
