use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::common::Message;

#[derive(Debug)]
pub struct InflightRequest {
    pub to: SocketAddr,
    pub sent_at: Instant,
    sender: flume::Sender<Message>,
}

impl InflightRequest {
    pub fn does_match(&self, from: &SocketAddr) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        // Same as SocketAddr::eq but ignores the ip if it is unspecified.
        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug)]
/// Requests waiting for their response, keyed by correlation id.
pub struct InflightRequests {
    next_id: u32,
    requests: HashMap<u32, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self {
            next_id: rand::random(),
            requests: HashMap::new(),
        }
    }

    /// Reserves a fresh correlation id for a request to `to`.
    pub fn add(&mut self, to: SocketAddr) -> (u32, flume::Receiver<Message>) {
        let id = self.next_free_id();
        let (sender, receiver) = flume::bounded(1);

        self.requests.insert(
            id,
            InflightRequest {
                to,
                sent_at: Instant::now(),
                sender,
            },
        );

        (id, receiver)
    }

    pub fn contains(&self, message_id: u32) -> bool {
        self.requests.contains_key(&message_id)
    }

    /// Hands `response` to the waiting request if it came from the address
    /// the request was sent to. Returns false for unexpected responses.
    pub fn resolve(&mut self, response: Message, from: &SocketAddr) -> bool {
        let matches = self
            .requests
            .get(&response.message_id)
            .map(|request| request.does_match(from))
            .unwrap_or(false);

        if !matches {
            return false;
        }

        match self.requests.remove(&response.message_id) {
            Some(request) => request.sender.try_send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&mut self, message_id: u32) {
        self.requests.remove(&message_id);
    }

    /// Drops requests older than `timeout`.
    pub fn cleanup(&mut self, timeout: Duration) {
        self.requests
            .retain(|_, request| request.sent_at.elapsed() < timeout);
    }

    /// Drops every request, their waiters observe a disconnect.
    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn next_free_id(&mut self) -> u32 {
        // Wrapping is fine, ids only need to be unique among live requests.
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }
}

impl Default for InflightRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use crate::common::{Id, MessageType, PeerAddress};

    use super::*;

    fn response_with_id(id: u32) -> Message {
        let peer = PeerAddress::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 1)));
        Message::request(peer, peer, 0, MessageType::Ok, 1).with_message_id(id)
    }

    #[test]
    fn ids_are_unique_and_wrap() {
        let mut inflight = InflightRequests::new();
        inflight.next_id = u32::MAX;

        let to = SocketAddr::from(([127, 0, 0, 1], 9000));
        let (a, _ra) = inflight.add(to);
        let (b, _rb) = inflight.add(to);

        assert_eq!(a, u32::MAX);
        assert_eq!(b, 0);

        inflight.next_id = u32::MAX;
        let (c, _rc) = inflight.add(to);
        assert_eq!(c, 1);
    }

    #[test]
    fn resolve_checks_address() {
        let mut inflight = InflightRequests::new();
        let to = SocketAddr::from(([127, 0, 0, 1], 9000));
        let (id, receiver) = inflight.add(to);

        let wrong = SocketAddr::from(([127, 0, 0, 1], 9001));
        assert!(!inflight.resolve(response_with_id(id), &wrong));
        assert!(!inflight.resolve(response_with_id(id.wrapping_add(1)), &to));
        assert!(inflight.contains(id));

        assert!(inflight.resolve(response_with_id(id), &to));
        assert!(!inflight.contains(id));
        assert_eq!(receiver.try_recv().unwrap().message_id, id);
    }

    #[test]
    fn unspecified_ip_matches_any() {
        let mut inflight = InflightRequests::new();
        let (id, _receiver) = inflight.add(SocketAddr::from(([0, 0, 0, 0], 9000)));

        assert!(inflight.resolve(
            response_with_id(id),
            &SocketAddr::from(([10, 1, 2, 3], 9000))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_expired() {
        let mut inflight = InflightRequests::new();
        let (id, receiver) = inflight.add(SocketAddr::from(([127, 0, 0, 1], 9000)));

        tokio::time::advance(Duration::from_secs(3)).await;
        inflight.cleanup(Duration::from_secs(2));

        assert!(inflight.is_empty());
        assert!(!inflight.contains(id));
        assert!(receiver.try_recv().is_err());
    }
}
