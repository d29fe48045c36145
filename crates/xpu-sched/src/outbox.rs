//! Host-side sending to one remote core
//!
//! Two ways in. [`Outbox::send`] busy-waits for ring space and is used by
//! threads the remote side never waits on (submitters, the completion
//! worker). [`Outbox::post`] never waits: if the ring is full or another
//! thread is mid-send it parks the message in a backlog that the host
//! receive thread flushes. The receive thread and the watchdog only post,
//! so a core stalled on a full host ring can always be drained.

use crate::channel::Sender;
use crate::doorbell::Doorbell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;
use xpu_proto::Payload;

/// Messages for one core
#[derive(Debug)]
pub struct Outbox {
    name: String,
    sender: Mutex<Sender>,
    backlog: Mutex<VecDeque<Payload>>,
    host_bell: Arc<Doorbell>,
}

impl Outbox {
    /// Wrap the host's sender for core `name`; `host_bell` wakes the flusher
    pub fn new(name: impl Into<String>, sender: Sender, host_bell: Arc<Doorbell>) -> Self {
        Self {
            name: name.into(),
            sender: Mutex::new(sender),
            backlog: Mutex::new(VecDeque::new()),
            host_bell,
        }
    }

    /// Core name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send, waiting for ring space; earlier posted messages go first
    pub fn send(&self, payload: Payload) {
        let mut sender = self.sender.lock();
        loop {
            let Some(pending) = self.backlog.lock().pop_front() else {
                break;
            };
            sender.send(pending);
        }
        sender.send(payload);
    }

    /// Send without waiting; returns `true` if the message had to be parked
    pub fn post(&self, payload: Payload) -> bool {
        let parked = match self.sender.try_lock() {
            Some(mut sender) => {
                let mut backlog = self.backlog.lock();
                Self::drain(&mut sender, &mut backlog);
                if backlog.is_empty() && sender.try_send(payload).is_ok() {
                    false
                } else {
                    backlog.push_back(payload);
                    true
                }
            }
            None => {
                self.backlog.lock().push_back(payload);
                true
            }
        };
        if parked {
            trace!("Parked {:?} for core {}", payload.ty, self.name);
            self.host_bell.ring();
        }
        parked
    }

    /// Move parked messages into the ring; returns `true` if any remain
    pub fn flush(&self) -> bool {
        let Some(mut sender) = self.sender.try_lock() else {
            return !self.backlog.lock().is_empty();
        };
        let mut backlog = self.backlog.lock();
        Self::drain(&mut sender, &mut backlog);
        !backlog.is_empty()
    }

    fn drain(sender: &mut Sender, backlog: &mut VecDeque<Payload>) {
        while let Some(next) = backlog.front().copied() {
            if sender.try_send(next).is_err() {
                break;
            }
            backlog.pop_front();
        }
    }

    /// Parked messages
    pub fn backlog(&self) -> usize {
        self.backlog.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel_pair;

    fn outbox(slots: usize) -> (Outbox, crate::channel::Receiver) {
        let host_bell = Arc::new(Doorbell::new());
        let (host, core) =
            channel_pair(slots, slots, Arc::clone(&host_bell), Arc::new(Doorbell::new())).unwrap();
        let (tx, _) = host.split();
        let (_, rx) = core.split();
        (Outbox::new("core", tx, host_bell), rx)
    }

    #[test]
    fn post_parks_when_full_and_flush_preserves_order() {
        let (out, mut rx) = outbox(2);
        assert!(!out.post(Payload::dec_ref(0, 0, 1)));
        assert!(!out.post(Payload::dec_ref(0, 0, 2)));
        assert!(out.post(Payload::dec_ref(0, 0, 3)));
        assert!(out.post(Payload::dec_ref(0, 0, 4)));
        assert_eq!(out.backlog(), 2);

        assert_eq!(rx.receive().unwrap().map(|p| p.lparam), Some(1));
        assert!(out.flush());
        assert_eq!(out.backlog(), 1);
        assert_eq!(rx.receive().unwrap().map(|p| p.lparam), Some(2));
        assert_eq!(rx.receive().unwrap().map(|p| p.lparam), Some(3));
        assert!(!out.flush());
        assert_eq!(rx.receive().unwrap().map(|p| p.lparam), Some(4));
    }

    #[test]
    fn send_drains_backlog_first() {
        let (out, mut rx) = outbox(4);
        out.backlog.lock().push_back(Payload::dec_ref(0, 0, 1));
        out.send(Payload::dec_ref(0, 0, 2));
        assert_eq!(rx.receive().unwrap().map(|p| p.lparam), Some(1));
        assert_eq!(rx.receive().unwrap().map(|p| p.lparam), Some(2));
        assert_eq!(out.backlog(), 0);
    }
}
