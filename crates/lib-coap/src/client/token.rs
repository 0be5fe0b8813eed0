use std::{collections::HashSet, time::Duration, time::Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token is already in use")]
    InUse,

    #[error("The empty token is still in safekeeping")]
    EmptyQuarantined,
}

/// Allocator for request tokens.
///
/// Tokens are drawn from a deterministic sequence: the single byte 0,
/// incremented as a little-endian counter that grows up to `max_size` bytes
/// and then wraps. Tokens currently bound to an exchange are skipped on
/// wrap-around, so two live exchanges can never share a token.
///
/// The empty token correlates replies by message ID alone (pings), so it is
/// handed out at most once at a time and, once released, kept out of
/// circulation for a safekeeping period to let stray replies drain.
#[derive(Debug)]
pub struct TokenManager {
    max_size: usize,
    safekeeping: Duration,
    next: Vec<u8>,
    in_use: HashSet<Vec<u8>>,
    empty_released_at: Option<Instant>,
}

impl TokenManager {
    pub fn new(max_size: usize, safekeeping: Duration) -> Self {
        Self {
            max_size: max_size.clamp(1, 8),
            safekeeping,
            next: vec![0],
            in_use: HashSet::new(),
            empty_released_at: None,
        }
    }

    /// Hand out the next free token of the sequence.
    pub fn acquire(&mut self) -> Vec<u8> {
        loop {
            let candidate = self.next.clone();
            self.advance();

            if !self.in_use.contains(&candidate) {
                self.in_use.insert(candidate.clone());
                return candidate;
            }
        }
    }

    /// Claim a caller-chosen token, subject to the same uniqueness rules.
    pub fn acquire_specific(&mut self, token: &[u8], now: Instant) -> Result<(), TokenError> {
        if self.in_use.contains(token) {
            return Err(TokenError::InUse);
        }

        if token.is_empty() {
            if let Some(released_at) = self.empty_released_at {
                if now.duration_since(released_at) < self.safekeeping {
                    return Err(TokenError::EmptyQuarantined);
                }
            }
        }

        self.in_use.insert(token.to_vec());
        Ok(())
    }

    pub fn release(&mut self, token: &[u8], now: Instant) {
        if self.in_use.remove(token) && token.is_empty() {
            self.empty_released_at = Some(now);
        }
    }

    pub fn in_use(&self, token: &[u8]) -> bool {
        self.in_use.contains(token)
    }

    /// Little-endian increment, growing by one byte on carry out of the
    /// current width and wrapping to the one-byte sequence start past
    /// `max_size` bytes.
    fn advance(&mut self) {
        for byte in self.next.iter_mut() {
            let (incremented, carry) = byte.overflowing_add(1);
            *byte = incremented;
            if !carry {
                return;
            }
        }

        if self.next.len() < self.max_size {
            self.next.push(1);
        } else {
            self.next = vec![0];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new(8, Duration::from_millis(48_000))
    }

    #[test]
    fn sequence_starts_at_zero_and_counts_up() {
        let mut tokens = manager();

        assert_eq!(tokens.acquire(), vec![0]);
        assert_eq!(tokens.acquire(), vec![1]);
        assert_eq!(tokens.acquire(), vec![2]);

        assert!(tokens.in_use(&[0]));
        assert!(!tokens.in_use(&[3]));
    }

    #[test]
    fn counter_grows_little_endian() {
        let mut tokens = manager();
        for _ in 0..=255 {
            tokens.acquire();
        }

        // 256 acquisitions exhausted the one-byte range.
        assert_eq!(tokens.acquire(), vec![0, 1]);
        assert_eq!(tokens.acquire(), vec![1, 1]);
    }

    #[test]
    fn acquired_tokens_are_distinct() {
        let mut tokens = manager();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(tokens.acquire()));
        }
    }

    #[test]
    fn wrap_skips_tokens_in_use() {
        let mut tokens = TokenManager::new(1, Duration::ZERO);

        let zero = tokens.acquire();
        assert_eq!(zero, vec![0]);

        // Drain the full one-byte space, then release everything except 0.
        let rest: Vec<_> = (0..255).map(|_| tokens.acquire()).collect();
        let now = Instant::now();
        for token in &rest {
            tokens.release(token, now);
        }

        // The counter wrapped past max_size; 0 is still held and must be
        // skipped.
        assert_eq!(tokens.acquire(), vec![1]);
    }

    #[test]
    fn released_tokens_can_be_reacquired() {
        let mut tokens = manager();
        let token = tokens.acquire();
        let now = Instant::now();

        tokens.release(&token, now);
        assert!(tokens.acquire_specific(&token, now).is_ok());
    }

    #[test]
    fn empty_token_is_exclusive_and_quarantined() {
        let mut tokens = manager();
        let now = Instant::now();

        assert!(tokens.acquire_specific(&[], now).is_ok());
        assert!(matches!(
            tokens.acquire_specific(&[], now),
            Err(TokenError::InUse)
        ));

        tokens.release(&[], now);
        assert!(matches!(
            tokens.acquire_specific(&[], now + Duration::from_millis(47_999)),
            Err(TokenError::EmptyQuarantined)
        ));
        assert!(tokens
            .acquire_specific(&[], now + Duration::from_millis(48_000))
            .is_ok());
    }
}
