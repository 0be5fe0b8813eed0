use std::time::Duration;

/// The only protocol version this implementation speaks. Encoded in the two
/// most significant bits of the first header byte.
///
/// See [RFC 7252 - Section 3](https://datatracker.ietf.org/doc/html/rfc7252#section-3)
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the fixed message header: version/type/token-length, code and
/// message ID.
pub const HEADER_LENGTH: usize = 4;

/// Tokens are 0 to 8 opaque bytes.
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Byte separating the option list from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Default UDP port for `coap://`.
///
/// See [RFC 7252 - Section 6.1](https://datatracker.ietf.org/doc/html/rfc7252#section-6.1)
pub const DEFAULT_PORT: u16 = 5683;

/// Largest datagram the client is prepared to receive.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Initial retransmission timeout before jitter is applied.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Upper jitter bound factor for the initial retransmission timeout.
pub const DEFAULT_ACK_RANDOM_FACTOR: f64 = 1.5;

/// A confirmable message is sent at most `DEFAULT_MAX_RETRANSMIT + 1` times.
pub const DEFAULT_MAX_RETRANSMIT: u32 = 4;

/// Default block size for block-wise transfers in either direction.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Smallest and largest block sizes expressible by a block option
/// (`2^(szx + 4)` with szx in 0..=6).
pub const MIN_BLOCK_SIZE: usize = 16;
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Default upper bound for generated token lengths.
pub const DEFAULT_TOKEN_MAX_SIZE: usize = 8;

/// How long a released empty token is kept out of circulation.
pub const DEFAULT_EMPTY_TOKEN_SAFEKEEPING: Duration = Duration::from_millis(48_000);

/// Value of the Max-Age option when a response does not carry one.
pub const DEFAULT_MAX_AGE: u32 = 60;

/// Observe sequence numbers wrap within 24 bits; two values closer than half
/// that range are ordered numerically, farther apart they are assumed to have
/// wrapped.
pub const OBSERVE_WRAP_THRESHOLD: u32 = 1 << 23;

/// A notification older by sequence number is still accepted when the newest
/// one was received longer ago than this.
pub const OBSERVE_REORDER_WINDOW: Duration = Duration::from_millis(128_000);
