//! The per-driver event queue separating blocking from non-blocking
//! events.
//!
//! Non-blocking events (notifies) drain first; a block event at the head
//! of the block queue triggers the block upcall once and then parks until
//! the matching unblock removes it. Unblock and the piggy-backed notify
//! are one transaction: the next block is only kicked after the notify
//! has been delivered.

use std::collections::VecDeque;

use herd_core::Node;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{DriverUpcall, UpcallSender};

#[derive(Debug)]
struct BlockEvent {
    sender: Node,
    callbacked: bool,
    removed: bool,
}

/// Queue of pending driver events awaiting delivery to the dispatcher.
#[derive(Debug, Default)]
pub struct EventQueue {
    nonblocked: VecDeque<(Node, Vec<u8>)>,
    blocked: VecDeque<BlockEvent>,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_notify(&mut self, sender: Node, payload: Vec<u8>) {
        self.nonblocked.push_back((sender, payload));
    }

    pub fn push_block(&mut self, sender: Node) {
        self.blocked.push_back(BlockEvent {
            sender,
            callbacked: false,
            removed: false,
        });
    }

    /// Mark the oldest still-pending block event as completed by its
    /// unblock. An unblock with no preceding block is a protocol bug:
    /// it is logged and asserted, never guessed around.
    pub fn remove_one_block(&mut self) {
        match self.blocked.iter_mut().find(|b| !b.removed) {
            Some(block) => {
                block.removed = true;
                debug!(sender = %block.sender, "unblock completes block event");
            }
            None => {
                error!("unblock received with no block event pending");
                debug_assert!(false, "unblock without a preceding block");
            }
        }
    }

    /// True when any block event is pending (not yet unblocked).
    #[must_use]
    pub fn has_pending_block(&self) -> bool {
        self.blocked.iter().any(|b| !b.removed)
    }

    /// Deliver queued events: all non-blocking events first, then kick
    /// the block event at the head of the queue (at most once).
    pub async fn drain(&mut self, upcalls: &UpcallSender) {
        while let Some((sender, payload)) = self.nonblocked.pop_front() {
            let _ = upcalls.send(DriverUpcall::Notify { sender, payload });
        }

        while let Some(head) = self.blocked.front() {
            if head.removed {
                self.blocked.pop_front();
                continue;
            }
            if !head.callbacked {
                let (reply_tx, reply_rx) = oneshot::channel();
                let sender = head.sender;
                let _ = upcalls.send(DriverUpcall::Block {
                    sender,
                    reply: reply_tx,
                });
                let callbacked = reply_rx.await.unwrap_or(false);
                if let Some(head) = self.blocked.front_mut() {
                    head.callbacked = callbacked;
                }
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use herd_core::NodeId;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cluster::UpcallReceiver;

    fn node(last: u8) -> Node {
        Node::new(NodeId::new(IpAddr::from([10, 0, 0, last]), 7000), 1, 0)
    }

    fn channel() -> (UpcallSender, UpcallReceiver) {
        mpsc::unbounded_channel()
    }

    async fn drain_with_block_reply(
        q: &mut EventQueue,
        tx: &UpcallSender,
        rx: &mut UpcallReceiver,
        answer: bool,
    ) -> Vec<String> {
        let drain = q.drain(tx);
        tokio::pin!(drain);

        let mut seen = Vec::new();
        let mut record = |up: DriverUpcall| match up {
            DriverUpcall::Notify { payload, .. } => {
                seen.push(format!("notify:{}", String::from_utf8_lossy(&payload)));
            }
            DriverUpcall::Block { sender, reply } => {
                seen.push(format!("block:{sender}"));
                let _ = reply.send(answer);
            }
            other => panic!("unexpected upcall {other:?}"),
        };

        loop {
            tokio::select! {
                () = &mut drain => break,
                Some(up) = rx.recv() => record(up),
            }
        }
        // The drain can finish before queued notify upcalls are read.
        while let Ok(up) = rx.try_recv() {
            record(up);
        }
        drop(record);
        seen
    }

    #[tokio::test]
    async fn nonblock_events_drain_before_block_kick() {
        let (tx, mut rx) = channel();
        let mut q = EventQueue::new();
        q.push_block(node(1));
        q.push_notify(node(2), b"a".to_vec());
        q.push_notify(node(2), b"b".to_vec());

        let seen = drain_with_block_reply(&mut q, &tx, &mut rx, false).await;
        assert_eq!(seen, vec!["notify:a", "notify:b", "block:10.0.0.1:7000"]);
    }

    #[tokio::test]
    async fn block_is_kicked_once_until_unblocked() {
        let (tx, mut rx) = channel();
        let mut q = EventQueue::new();
        q.push_block(node(1));

        let seen = drain_with_block_reply(&mut q, &tx, &mut rx, true).await;
        assert_eq!(seen.len(), 1);

        // Head is callbacked: draining again kicks nothing.
        let seen = drain_with_block_reply(&mut q, &tx, &mut rx, true).await;
        assert!(seen.is_empty());

        // Unblock removes it; the next block becomes eligible.
        q.push_block(node(2));
        q.remove_one_block();
        let seen = drain_with_block_reply(&mut q, &tx, &mut rx, false).await;
        assert_eq!(seen, vec!["block:10.0.0.2:7000"]);
    }

    #[tokio::test]
    async fn second_block_waits_behind_head() {
        let (tx, mut rx) = channel();
        let mut q = EventQueue::new();
        q.push_block(node(1));
        q.push_block(node(2));

        let seen = drain_with_block_reply(&mut q, &tx, &mut rx, true).await;
        assert_eq!(seen, vec!["block:10.0.0.1:7000"]);
        assert!(q.has_pending_block());
    }

    #[test]
    #[should_panic(expected = "unblock without a preceding block")]
    fn unblock_without_block_asserts_in_debug() {
        let mut q = EventQueue::new();
        q.remove_one_block();
    }
}
