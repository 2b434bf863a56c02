//! Waiting requests and the FIFO queue they park in.

use std::collections::VecDeque;

use tokio::sync::oneshot;

/// A parked acquisition waiting for the refill task to hand it tokens.
#[derive(Debug)]
pub(crate) struct WaitingRequest {
    pub id: u64,
    /// Tokens that must be available before the request is served
    pub need: u64,
    /// Tokens deducted when served (0 for wait-only requests)
    pub consume: u64,
    notify: Option<oneshot::Sender<()>>,
    abandoned: bool,
}

impl WaitingRequest {
    fn new(id: u64, need: u64, consume: u64) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id,
            need,
            consume,
            notify: Some(tx),
            abandoned: false,
        };
        (request, rx)
    }

    /// True once the owner gave up, either by deadline or by dropping its future.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned || self.notify.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Wakes the owner. Returns false if the owner is already gone.
    pub fn notify(mut self) -> bool {
        match self.notify.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn abandon(&mut self) {
        self.abandoned = true;
        self.notify = None;
    }
}

/// Arrival-ordered queue of waiting requests.
///
/// Only ever touched while the bucket state lock is held. `live` counts the
/// queued requests not yet marked abandoned.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    requests: VecDeque<WaitingRequest>,
    next_id: u64,
    live: usize,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request at the tail and returns its id with the receiving half
    /// of its wake signal.
    pub fn push(&mut self, need: u64, consume: u64) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let (request, rx) = WaitingRequest::new(id, need, consume);
        self.requests.push_back(request);
        self.live += 1;
        (id, rx)
    }

    pub fn front(&self) -> Option<&WaitingRequest> {
        self.requests.front()
    }

    pub fn pop_front(&mut self) -> Option<WaitingRequest> {
        let request = self.requests.pop_front()?;
        if !request.abandoned {
            self.live -= 1;
        }
        Some(request)
    }

    /// Abandons the request. The head is only marked, for the refill task to
    /// discard; any other request is removed outright. Returns false when the
    /// request is no longer queued, which means it has already been served.
    pub fn abandon(&mut self, id: u64) -> bool {
        let Some(index) = self.requests.iter().position(|r| r.id == id) else {
            return false;
        };

        if !self.requests[index].abandoned {
            self.live -= 1;
        }

        if index == 0 {
            self.requests[0].abandon();
        } else {
            self.requests.remove(index);
        }
        true
    }

    /// Whether any request still waiting to be served is queued.
    pub fn has_live(&self) -> bool {
        self.live > 0
    }

    /// Number of queued requests that have not been abandoned.
    pub fn live_len(&self) -> usize {
        self.live
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
