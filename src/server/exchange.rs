//! Bookkeeping for a confirmable request sent by a mock server.

use std::time::Duration;

use crate::{
    coap::{Message, MessageType},
    server::timing::TransmissionParams,
    time::Deadline,
};

/// What a received message means for a pending exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMatch {
    /// Unrelated message.
    None,
    /// Empty ACK; the response follows separately.
    Acknowledged,
    /// Piggy-backed or separate response.
    Response,
    /// The peer rejected the request with Reset.
    Reset,
}

/// One outstanding request awaiting its ACK and response.
#[derive(Debug, Clone)]
pub struct PendingExchange {
    pub request: Message,
    retransmissions: u32,
    timeout: Duration,
    next_retransmit: Deadline,
    ack_received: bool,
}

impl PendingExchange {
    /// Starts tracking `request`, which has just been transmitted.
    #[must_use]
    pub fn new(request: Message, params: &TransmissionParams) -> Self {
        let timeout = params.initial_timeout();
        Self {
            request,
            retransmissions: 0,
            timeout,
            next_retransmit: Deadline::after(timeout),
            ack_received: false,
        }
    }

    #[must_use]
    pub fn is_confirmable(&self) -> bool {
        self.request.msg_type == MessageType::Confirmable
    }

    #[must_use]
    pub fn ack_received(&self) -> bool {
        self.ack_received
    }

    #[must_use]
    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// When the next retransmission is due, if any is still needed.
    #[must_use]
    pub fn next_retransmit(&self) -> Option<Deadline> {
        (self.is_confirmable() && !self.ack_received).then_some(self.next_retransmit)
    }

    /// Classifies `msg` against this exchange. An empty ACK marks the
    /// request as acknowledged.
    pub fn classify(&mut self, msg: &Message) -> ExchangeMatch {
        let same_id = msg.message_id == self.request.message_id;
        match msg.msg_type {
            MessageType::Acknowledgement if same_id && self.is_confirmable() => {
                self.ack_received = true;
                if msg.code.is_empty() {
                    ExchangeMatch::Acknowledged
                } else {
                    ExchangeMatch::Response
                }
            }
            MessageType::Reset if same_id => ExchangeMatch::Reset,
            MessageType::Confirmable | MessageType::NonConfirmable
                if msg.code.is_response() && msg.token == self.request.token =>
            {
                if self.is_confirmable() && !self.ack_received {
                    // a separate response implies the lost ACK
                    self.ack_received = true;
                }
                ExchangeMatch::Response
            }
            _ => ExchangeMatch::None,
        }
    }

    /// Called when the retransmission timer fires. Returns `true` when the
    /// request should be sent again, `false` once retransmissions are
    /// exhausted.
    pub fn on_timeout(&mut self, params: &TransmissionParams) -> bool {
        if self.retransmissions >= params.max_retransmit {
            return false;
        }
        self.retransmissions += 1;
        self.timeout *= 2;
        self.next_retransmit = Deadline::after(self.timeout);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{Code, Token};

    fn request() -> Message {
        Message::new(
            MessageType::Confirmable,
            Code::GET,
            100,
            Token::new(vec![1, 2, 3]).unwrap(),
        )
    }

    fn params(max_retransmit: u32) -> TransmissionParams {
        TransmissionParams::new(Duration::from_secs(1), 1.0, max_retransmit)
    }

    #[tokio::test]
    async fn test_piggybacked_response() {
        let mut exchange = PendingExchange::new(request(), &params(4));
        let ack = Message::new(
            MessageType::Acknowledgement,
            Code::CONTENT,
            100,
            Token::new(vec![1, 2, 3]).unwrap(),
        );
        assert_eq!(exchange.classify(&ack), ExchangeMatch::Response);
        assert!(exchange.next_retransmit().is_none());
    }

    #[tokio::test]
    async fn test_separate_response() {
        let mut exchange = PendingExchange::new(request(), &params(4));
        assert_eq!(
            exchange.classify(&Message::empty_ack(100)),
            ExchangeMatch::Acknowledged
        );
        assert_eq!(
            exchange.classify(&Message::empty_ack(101)),
            ExchangeMatch::None
        );
        let separate = Message::new(
            MessageType::Confirmable,
            Code::CONTENT,
            7,
            Token::new(vec![1, 2, 3]).unwrap(),
        );
        assert_eq!(exchange.classify(&separate), ExchangeMatch::Response);
        let other_token = Message::new(MessageType::Confirmable, Code::CONTENT, 8, Token::empty());
        assert_eq!(exchange.classify(&other_token), ExchangeMatch::None);
    }

    #[tokio::test]
    async fn test_reset_and_exhaustion() {
        let mut exchange = PendingExchange::new(request(), &params(2));
        assert_eq!(exchange.classify(&Message::reset(100)), ExchangeMatch::Reset);
        assert!(exchange.on_timeout(&params(2)));
        assert!(exchange.on_timeout(&params(2)));
        assert!(!exchange.on_timeout(&params(2)));
        assert_eq!(exchange.retransmissions(), 2);
    }
}
