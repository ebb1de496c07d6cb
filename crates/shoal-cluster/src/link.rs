//! Outgoing half of a connection
//!
//! A `PeerLink` is a cheap clonable handle that queues frames to the
//! connection's writer task, preserving per-connection FIFO order.  The
//! writer exits once every handle is dropped, which closes the socket.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use shoal_proto::{Frame, Header, Message};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct PeerLink {
    id: u64,
    seq: Arc<AtomicU32>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl PeerLink {
    /// Create a link and the frame stream its writer task consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            seq: Arc::new(AtomicU32::new(1)),
            tx,
        };
        (link, rx)
    }

    /// Process-unique identifier for this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a request frame.  Returns false once the writer is gone; the
    /// pending `LinkClosed` event will clean up.
    pub fn send(&self, msg: &Message) -> bool {
        let request_id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.tx.send(Frame::request(request_id, msg)).is_ok()
    }

    /// Queue a reply to the request carried by `to`.
    pub fn reply(&self, to: &Header, msg: &Message) -> bool {
        self.tx.send(Frame::reply(to, msg)).is_ok()
    }
}

impl PartialEq for PeerLink {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerLink {}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_proto::command;

    #[test]
    fn test_send_assigns_increasing_request_ids() {
        let (link, mut rx) = PeerLink::new();
        assert!(link.send(&Message::LoadLevels));
        assert!(link.send(&Message::LoadLevels));

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert!(b.header.request_id > a.header.request_id);
        assert_eq!(a.header.command, command::LOADLEVELS);
    }

    #[test]
    fn test_reply_echoes_request_id() {
        let (link, mut rx) = PeerLink::new();
        link.send(&Message::Promote { hash: 3 });
        let req = rx.try_recv().unwrap();

        link.reply(&req.header, &Message::Ack);
        let rep = rx.try_recv().unwrap();
        assert_eq!(rep.header.request_id, req.header.request_id);
        assert_eq!(rep.header.reply_cmd, command::PROMOTE);
    }

    #[test]
    fn test_send_after_writer_drop() {
        let (link, rx) = PeerLink::new();
        drop(rx);
        assert!(!link.send(&Message::LoadLevels));
    }
}
