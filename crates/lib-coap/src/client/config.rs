use std::time::Duration;

use crate::constants;

/// Transmission parameters of a client. Every value can be overridden per
/// client via [`crate::ClientBuilder`] and, where it makes sense, per request
/// via [`RequestOptions`].
#[derive(Debug, Clone)]
pub struct TransmissionParameters {
    /// Initial retransmission timeout for confirmable messages.
    pub ack_timeout: Duration,

    /// The initial timeout is drawn uniformly from
    /// `[ack_timeout, ack_timeout * ack_random_factor)`.
    pub ack_random_factor: f64,

    /// A confirmable message is retransmitted at most this many times.
    pub max_retransmit: u32,

    /// Time an exchange may sit without progress before it times out.
    /// Computed from the other parameters unless overridden.
    pub exchange_timeout: Option<Duration>,

    /// Lifetime of duplicate-detection entries. Defaults to half the
    /// exchange timeout.
    pub duplicate_timeout: Option<Duration>,

    /// Preferred block size for block-wise transfers, in bytes.
    pub block_size: usize,

    /// Upper bound for generated token lengths.
    pub token_max_size: usize,

    /// Quarantine period for the released empty token.
    pub empty_token_safekeeping: Duration,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: constants::DEFAULT_ACK_TIMEOUT,
            ack_random_factor: constants::DEFAULT_ACK_RANDOM_FACTOR,
            max_retransmit: constants::DEFAULT_MAX_RETRANSMIT,
            exchange_timeout: None,
            duplicate_timeout: None,
            block_size: constants::DEFAULT_BLOCK_SIZE,
            token_max_size: constants::DEFAULT_TOKEN_MAX_SIZE,
            empty_token_safekeeping: constants::DEFAULT_EMPTY_TOKEN_SAFEKEEPING,
        }
    }
}

impl TransmissionParameters {
    /// The effective exchange timeout:
    /// `ack_timeout * 2^(max_retransmit + 1) * ack_random_factor` unless
    /// overridden. With the defaults this is roughly 96 seconds, the time a
    /// full retransmission run plus the final wait can take.
    pub fn exchange_timeout(&self) -> Duration {
        match self.exchange_timeout {
            Some(timeout) => timeout,
            None => self
                .ack_timeout
                .mul_f64(f64::from(1u32 << (self.max_retransmit + 1)))
                .mul_f64(self.ack_random_factor),
        }
    }

    /// The effective duplicate-detection lifetime.
    pub fn duplicate_timeout(&self) -> Duration {
        match self.duplicate_timeout {
            Some(timeout) => timeout,
            None => self.exchange_timeout() / 2,
        }
    }
}

/// Per-request overrides accepted by [`crate::Client::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Send the request non-confirmable instead of confirmable.
    pub non_confirmable: bool,

    /// Block size override for this exchange. Supplying one implies
    /// `include_block2` for GET requests.
    pub block_size: Option<usize>,

    /// Attach an early-negotiation Block2 (NUM 0, M 0) to GET requests.
    pub include_block2: bool,

    /// Exchange timeout override for this exchange.
    pub exchange_timeout: Option<Duration>,

    /// Retransmission budget override for this exchange.
    pub max_retransmit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_timeouts() {
        let params = TransmissionParameters::default();

        // 2000ms * 2^5 * 1.5
        assert_eq!(params.exchange_timeout(), Duration::from_millis(96_000));
        assert_eq!(params.duplicate_timeout(), Duration::from_millis(48_000));
    }

    #[test]
    fn overrides_win() {
        let params = TransmissionParameters {
            exchange_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };

        assert_eq!(params.exchange_timeout(), Duration::from_secs(5));
        assert_eq!(params.duplicate_timeout(), Duration::from_millis(2_500));
    }
}
