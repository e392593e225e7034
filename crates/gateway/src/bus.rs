//! Message bus (§4.5): two bounded MPSC queues, inbound and outbound, each
//! capacity 100. Publishing blocks when full — that's the backpressure
//! signal, not a bug, so every publisher uses the blocking `send` rather
//! than `try_send`.
//!
//! The channel-to-agent pipeline publishes a fully-resolved [`MsgContext`]
//! to the inbound queue once pairing/dedupe/debounce/pending-history have
//! all passed (§4.8 step 5); a consumer task runs the agent turn and
//! publishes the reply to the outbound queue; a second consumer task
//! chunks and delivers it through the channel's outbound adapter.

use tokio::sync::{Mutex, mpsc};

use moltis_common::types::{MsgContext, ReplyPayload};

/// Capacity of each queue, per §4.5.
pub const QUEUE_CAPACITY: usize = 100;

/// A reply ready to be chunked and delivered to a channel adapter.
pub struct OutboundDelivery {
    pub channel: String,
    pub account_id: String,
    pub chat_id: String,
    pub reply: ReplyPayload,
}

pub struct MessageBus {
    inbound_tx: mpsc::Sender<MsgContext>,
    inbound_rx: Mutex<mpsc::Receiver<MsgContext>>,
    outbound_tx: mpsc::Sender<OutboundDelivery>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundDelivery>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    /// Publish a resolved message to the inbound queue. Blocks if the
    /// queue is full.
    pub async fn publish_inbound(&self, ctx: MsgContext) -> Result<(), mpsc::error::SendError<MsgContext>> {
        self.inbound_tx.send(ctx).await
    }

    /// Consume the next inbound message. `None` once the queue is closed
    /// and drained.
    pub async fn consume_inbound(&self) -> Option<MsgContext> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Publish a reply to the outbound queue. Blocks if the queue is full.
    pub async fn publish_outbound(
        &self,
        item: OutboundDelivery,
    ) -> Result<(), mpsc::error::SendError<OutboundDelivery>> {
        self.outbound_tx.send(item).await
    }

    /// Consume the next outbound delivery. `None` once the queue is closed
    /// and drained.
    pub async fn consume_outbound(&self) -> Option<OutboundDelivery> {
        self.outbound_rx.lock().await.recv().await
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
