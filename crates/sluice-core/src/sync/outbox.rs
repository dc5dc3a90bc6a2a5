//! Outgoing batcher
//!
//! Two FIFO queues: control-plane requests (calls, auth, track) and
//! subscription-control operations. Enqueuing while connected schedules a
//! flush; the connection task performs it once no more commands are ready,
//! so everything queued in the same tick goes out as one message.

use tracing::debug;

use super::message::ClientOp;

#[derive(Debug, Default)]
pub struct Outbox {
    control: Vec<ClientOp>,
    subscriptions: Vec<ClientOp>,
    flush_scheduled: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation to its queue, scheduling a flush when connected
    pub fn push(&mut self, op: ClientOp, connected: bool) {
        debug!("Queueing {:?}", op);
        if op.is_subscription_control() {
            self.subscriptions.push(op);
        } else {
            self.control.push(op);
        }
        if connected {
            self.flush_scheduled = true;
        }
    }

    /// Pending subscription-control operations, oldest first
    pub fn subscriptions(&self) -> &[ClientOp] {
        &self.subscriptions
    }

    /// First pending subscription-control operation matching `pred`
    pub fn find_subscription_op(
        &mut self,
        mut pred: impl FnMut(&ClientOp) -> bool,
    ) -> Option<&mut ClientOp> {
        self.subscriptions.iter_mut().find(|op| pred(op))
    }

    /// Drop pending subscription-control operations matching `pred`
    ///
    /// Returns how many were dropped.
    pub fn drop_subscription_ops(&mut self, mut pred: impl FnMut(&ClientOp) -> bool) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|op| !pred(op));
        before - self.subscriptions.len()
    }

    pub fn has_subscription_op(&self, pred: impl FnMut(&ClientOp) -> bool) -> bool {
        self.subscriptions.iter().any(pred)
    }

    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.subscriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.control.len() + self.subscriptions.len()
    }

    pub fn schedule_flush(&mut self) {
        self.flush_scheduled = true;
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    /// Forget a scheduled flush; queued operations are kept for reconnect
    pub fn cancel_flush(&mut self) {
        self.flush_scheduled = false;
    }

    /// Take everything queued as one batch, leaving both queues empty
    ///
    /// Returns `None` when there is nothing to send.
    pub fn take_batch(&mut self) -> Option<Vec<ClientOp>> {
        self.flush_scheduled = false;
        if self.is_empty() {
            return None;
        }
        let mut batch = std::mem::take(&mut self.control);
        batch.append(&mut self.subscriptions);
        Some(batch)
    }

    /// Return a taken batch to the front of the queues, keeping its order
    pub fn restore(&mut self, batch: Vec<ClientOp>) {
        let (mut subscriptions, mut control): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(ClientOp::is_subscription_control);
        control.append(&mut self.control);
        subscriptions.append(&mut self.subscriptions);
        self.control = control;
        self.subscriptions = subscriptions;
    }
}
