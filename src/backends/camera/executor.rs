// SPDX-License-Identifier: GPL-3.0-only
//! Single-threaded message executor for pipeline actors
//!
//! Each camera pipeline owns one executor. Messages are handled strictly in
//! the order they were posted, on a dedicated named thread, so one camera's
//! operations and driver events never interleave and never wait on another
//! camera.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by the message handler to control the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Keep handling messages
    Continue,
    /// Exit after this message
    Stop,
}

/// Handle to a running executor thread
///
/// # Example
///
/// ```ignore
/// let executor = SerialExecutor::start("camera-0", |_sender| Core::new(), |core, msg| {
///     core.handle(msg)
/// });
/// executor.post(Command::StopPreview);
/// ```
pub struct SerialExecutor<M: Send + 'static> {
    sender: Sender<M>,
    thread_handle: Option<JoinHandle<()>>,
    name: String,
}

impl<M: Send + 'static> SerialExecutor<M> {
    /// Spawn the executor thread
    ///
    /// `init_fn` runs on the new thread and receives a sender to the
    /// executor's own queue, so the state can post follow-up messages.
    pub fn start<S, I, F>(name: &str, init_fn: I, mut handler: F) -> Self
    where
        S: 'static,
        I: FnOnce(Sender<M>) -> S + Send + 'static,
        F: FnMut(&mut S, M) -> LoopAction + Send + 'static,
    {
        let (sender, receiver): (Sender<M>, Receiver<M>) = mpsc::channel();
        let self_sender = sender.clone();
        let name_clone = name.to_string();

        info!(name = %name, "Starting executor");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = init_fn(self_sender);
                debug!(name = %name_clone, "Executor thread started");

                while let Ok(message) = receiver.recv() {
                    if handler(&mut state, message) == LoopAction::Stop {
                        debug!(name = %name_clone, "Executor requested stop");
                        break;
                    }
                }

                info!(name = %name_clone, "Executor thread exiting");
            });

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(name = %name, error = %e, "Failed to spawn executor thread");
                None
            }
        };

        Self {
            sender,
            thread_handle,
            name: name.to_string(),
        }
    }

    /// Queue a message, returns false if the thread is gone
    pub fn post(&self, message: M) -> bool {
        self.thread_handle.is_some() && self.sender.send(message).is_ok()
    }

    /// Check if the thread is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish
    ///
    /// Only call once a stop message has been handled, otherwise this blocks
    /// until the queue is closed.
    pub fn join(mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "Executor thread panicked");
            }
        }
    }

    /// Let the thread finish on its own
    pub fn detach(mut self) {
        if self.thread_handle.take().is_some() {
            debug!(name = %self.name, "Detached executor thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_messages_handled_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let executor = SerialExecutor::start(
            "test-order",
            |_| (),
            move |_, value: u32| {
                seen_clone.lock().unwrap().push(value);
                if value == 3 {
                    LoopAction::Stop
                } else {
                    LoopAction::Continue
                }
            },
        );

        for value in 0..=3 {
            assert!(executor.post(value));
        }
        executor.join();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_state_can_post_to_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let executor = SerialExecutor::start(
            "test-self-post",
            |sender: Sender<u32>| sender,
            move |sender, value: u32| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                if value < 5 {
                    let _ = sender.send(value + 1);
                    LoopAction::Continue
                } else {
                    LoopAction::Stop
                }
            },
        );

        executor.post(0);
        for _ in 0..100 {
            if !executor.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!executor.is_running());
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        executor.join();
    }
}
