use std::time::Duration;

use rand::Rng;

use crate::{
    client::timer::TimerId,
    types::{ExchangeKey, Message, TransactionKey},
};

/// Reliability state of one outstanding confirmable message. Created when
/// the CON is first sent, destroyed on ACK, RST, timeout or cancel.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub key: TransactionKey,

    /// The exchange this transaction belongs to; timeouts are mirrored onto
    /// that exchange's request handle.
    pub exchange_key: ExchangeKey,

    /// The outgoing message, kept for observability events.
    pub message: Message,

    /// Encoded datagram, resent verbatim on each retry.
    pub bytes: Vec<u8>,

    pub retries: u32,
    pub max_retransmit: u32,
    pub current_timeout: Duration,
    pub timer: Option<TimerId>,
}

impl Transaction {
    /// Whether the retransmission budget still allows another copy.
    pub fn can_retry(&self) -> bool {
        self.retries <= self.max_retransmit
    }
}

/// The initial retry timeout, drawn uniformly from
/// `[ack_timeout, ack_timeout * factor)`. A factor of 1.0 or below
/// degenerates to exactly `ack_timeout`, which the deterministic tests rely
/// on.
pub(crate) fn initial_timeout(ack_timeout: Duration, factor: f64) -> Duration {
    if factor <= 1.0 {
        return ack_timeout;
    }

    let spread = ack_timeout.mul_f64(factor - 1.0);
    ack_timeout + spread.mul_f64(rand::thread_rng().gen::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_timeout_is_within_bounds() {
        let ack = Duration::from_millis(2000);
        for _ in 0..100 {
            let timeout = initial_timeout(ack, 1.5);
            assert!(timeout >= ack);
            assert!(timeout < Duration::from_millis(3000));
        }
    }

    #[test]
    fn factor_one_is_deterministic() {
        let ack = Duration::from_millis(2000);
        assert_eq!(initial_timeout(ack, 1.0), ack);
    }
}
