// SPDX-License-Identifier: GPL-3.0-only

//! Completion callbacks and the per-pipeline callback registry
//!
//! Every pipeline operation is armed with a [`Ticket`] (operation kind plus
//! a generation). Driver events carry the ticket back, so an event can only
//! complete the exact request that produced it. Errors that find no armed
//! callback fall through to the long-lived common subscription.

use crate::errors::{RigError, RigResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, mpsc};
use tracing::{debug, warn};

use super::lock;
use super::types::CameraBehavior;

/// One-shot completion of an asynchronous operation
pub struct Callback {
    inner: Box<dyn FnOnce(RigResult<()>) + Send>,
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(RigResult<()>) + Send + 'static,
    {
        Self { inner: Box::new(f) }
    }

    /// Callback paired with an awaitable receiver
    pub fn channel() -> (Self, tokio::sync::oneshot::Receiver<RigResult<()>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (callback, rx)
    }

    /// Callback paired with a blocking receiver
    pub fn sync_channel() -> (Self, mpsc::Receiver<RigResult<()>>) {
        let (tx, rx) = mpsc::channel();
        let callback = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (callback, rx)
    }

    pub fn complete(self, result: RigResult<()>) {
        (self.inner)(result)
    }

    pub fn success(self) {
        self.complete(Ok(()))
    }

    pub fn error(self, err: RigError) {
        self.complete(Err(err))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// Completion of a resolution change, reports the primary pipeline's behavior
pub struct ChangeResolutionListener {
    inner: Box<dyn FnOnce(RigResult<CameraBehavior>) + Send>,
}

impl ChangeResolutionListener {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(RigResult<CameraBehavior>) + Send + 'static,
    {
        Self { inner: Box::new(f) }
    }

    pub fn channel() -> (Self, tokio::sync::oneshot::Receiver<RigResult<CameraBehavior>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let listener = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (listener, rx)
    }

    pub fn complete(self, result: RigResult<CameraBehavior>) {
        (self.inner)(result)
    }
}

/// Standing error subscription, may fire any number of times
pub type CommonCallback = Arc<dyn Fn(RigError) + Send + Sync>;

/// Operations that can be armed on a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Open,
    StartPreview,
    UpdatePreview,
    StartCapture,
    Still,
}

/// Identity of one armed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub op: OpKind,
    pub generation: u64,
}

struct Registration {
    generation: u64,
    /// `None` when the operation was issued internally without a callback
    callback: Option<Callback>,
}

/// Per-pipeline map from operation to its armed callback
pub struct CallbackRegistry {
    camera: usize,
    next_generation: u64,
    slots: HashMap<OpKind, Registration>,
    common: Arc<Mutex<Option<CommonCallback>>>,
}

impl CallbackRegistry {
    pub fn new(camera: usize) -> Self {
        Self::with_common(camera, Arc::new(Mutex::new(None)))
    }

    /// Registry whose common subscription lives in a slot shared with other owners
    pub fn with_common(camera: usize, common: Arc<Mutex<Option<CommonCallback>>>) -> Self {
        Self {
            camera,
            next_generation: 0,
            slots: HashMap::new(),
            common,
        }
    }

    pub fn set_common(&mut self, common: Option<CommonCallback>) {
        *lock(&self.common) = common;
    }

    /// Arm `op`, superseding any pending request of the same kind
    pub fn arm(&mut self, op: OpKind, callback: Option<Callback>) -> Ticket {
        self.next_generation += 1;
        let generation = self.next_generation;
        let previous = self.slots.insert(
            op,
            Registration {
                generation,
                callback,
            },
        );
        if let Some(Registration {
            callback: Some(superseded),
            ..
        }) = previous
        {
            debug!(camera = self.camera, ?op, "Superseding pending callback");
            superseded.error(RigError::new(
                crate::errors::ErrorCode::Unknown,
                format!("{:?} superseded by a newer request", op),
            ));
        }
        Ticket { op, generation }
    }

    /// Whether `ticket` is still the armed request for its operation
    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.slots
            .get(&ticket.op)
            .is_some_and(|r| r.generation == ticket.generation)
    }

    /// Whether `ticket` is current and carries a caller callback
    pub fn has_callback(&self, ticket: Ticket) -> bool {
        self.slots
            .get(&ticket.op)
            .is_some_and(|r| r.generation == ticket.generation && r.callback.is_some())
    }

    /// Remove the registration for `ticket` and hand its callback out
    pub fn take(&mut self, ticket: Ticket) -> Option<Callback> {
        if !self.is_current(ticket) {
            return None;
        }
        self.slots.remove(&ticket.op).and_then(|r| r.callback)
    }

    /// Drop the registration of `op` without firing it
    pub fn disarm(&mut self, op: OpKind) {
        self.slots.remove(&op);
    }

    /// Complete `ticket`; errors without an armed callback go to the common subscription
    pub fn resolve(&mut self, ticket: Ticket, result: RigResult<()>) {
        match (self.take(ticket), result) {
            (Some(callback), result) => callback.complete(result),
            (None, Ok(())) => {}
            (None, Err(err)) => self.notify_common(err),
        }
    }

    /// Fail every armed callback, returns whether any caller was notified
    pub fn fail_all(&mut self, err: &RigError) -> bool {
        let mut delivered = false;
        for (_, registration) in self.slots.drain() {
            if let Some(callback) = registration.callback {
                callback.error(err.clone());
                delivered = true;
            }
        }
        delivered
    }

    /// Fail the registration of `op` if armed
    pub fn cancel(&mut self, op: OpKind, err: RigError) {
        if let Some(Registration {
            callback: Some(callback),
            ..
        }) = self.slots.remove(&op)
        {
            callback.error(err);
        }
    }

    pub fn notify_common(&self, err: RigError) {
        let common = lock(&self.common).clone();
        match common {
            Some(common) => common(err),
            None => warn!(camera = self.camera, error = %err, "Dropping unrouted camera error"),
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting() -> (Callback, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (
            Callback::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn test_callback_fires_at_most_once() {
        let mut registry = CallbackRegistry::new(0);
        let (callback, count) = counting();
        let ticket = registry.arm(OpKind::Open, Some(callback));
        registry.resolve(ticket, Ok(()));
        registry.resolve(ticket, Ok(()));
        registry.resolve(ticket, Err(ErrorCode::CameraNotOpened.into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_late_error_goes_to_common() {
        let mut registry = CallbackRegistry::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        registry.set_common(Some(Arc::new(move |err: RigError| {
            s.lock().unwrap().push(err.code);
        })));

        let (callback, count) = counting();
        let ticket = registry.arm(OpKind::UpdatePreview, Some(callback));
        registry.resolve(ticket, Ok(()));
        registry.resolve(ticket, Err(ErrorCode::CameraSessionNotCreate.into()));
        registry.resolve(ticket, Err(ErrorCode::CameraNotOpened.into()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ErrorCode::CameraSessionNotCreate, ErrorCode::CameraNotOpened]
        );
    }

    #[test]
    fn test_stale_ticket_cannot_complete_newer_request() {
        let mut registry = CallbackRegistry::new(0);
        let (first, first_count) = counting();
        let (second, second_count) = counting();
        let old = registry.arm(OpKind::StartPreview, Some(first));
        let new = registry.arm(OpKind::StartPreview, Some(second));

        // superseded request is failed right away
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        registry.resolve(old, Ok(()));
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
        registry.resolve(new, Ok(()));
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fail_all_drains() {
        let mut registry = CallbackRegistry::new(0);
        let (a, a_count) = counting();
        let (b, b_count) = counting();
        registry.arm(OpKind::Open, Some(a));
        registry.arm(OpKind::UpdatePreview, Some(b));
        assert!(registry.fail_all(&ErrorCode::CameraNotOpened.into()));
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_channel_bridge() {
        let (callback, rx) = Callback::channel();
        std::thread::spawn(move || callback.error(ErrorCode::TimeOut.into()));
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap_err().code, ErrorCode::TimeOut);
    }
}
