//! Message ID and token generation for outgoing exchanges.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

/// Sequential message ID source starting at a random offset.
pub struct MessageIdGenerator {
    next: AtomicU16,
}

impl MessageIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    #[must_use]
    pub fn starting_at(first: u16) -> Self {
        MessageIdGenerator {
            next: AtomicU16::new(first),
        }
    }

    /// Returns the next ID, wrapping at 65535.
    pub fn generate(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces 8-byte tokens: a random prefix with a running counter mixed in,
/// so tokens from one generator never repeat within 2^32 requests.
pub struct TokenGenerator {
    prefix: u32,
    counter: AtomicU64,
}

impl TokenGenerator {
    #[must_use]
    pub fn new() -> Self {
        TokenGenerator {
            prefix: rand::random(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn generate(&self) -> super::Token {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) as u32;
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&self.prefix.to_be_bytes());
        bytes.extend_from_slice(&n.to_be_bytes());
        super::Token::new(bytes).unwrap_or_default()
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_wrap() {
        let ids = MessageIdGenerator::starting_at(u16::MAX);
        assert_eq!(ids.generate(), u16::MAX);
        assert_eq!(ids.generate(), 0);
        assert_eq!(ids.generate(), 1);
    }

    #[test]
    fn test_tokens_are_distinct() {
        let tokens = TokenGenerator::new();
        let a = tokens.generate();
        let b = tokens.generate();
        assert_eq!(a.as_bytes().len(), 8);
        assert_ne!(a, b);
        assert_eq!(a.as_bytes()[..4], b.as_bytes()[..4]);
    }
}
