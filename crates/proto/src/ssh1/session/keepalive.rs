//! Keep-alive heartbeat.
//!
//! Sends a low-priority `MSG_DEBUG` packet on a timer so idle connections
//! are not dropped by middleboxes. The interval can be changed or disabled
//! while the task runs.

use crate::ssh1::message::MessageType;
use crate::ssh1::packet::Packet;
use std::time::Duration;
use tern_platform::TernResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Text carried by keep-alive packets.
pub const HEARTBEAT: &[u8] = b"heartbeat";

/// Keep-alive task handle.
///
/// The interval lives in a `watch` cell; the task picks up changes without
/// restarting. `None` pauses it.
pub struct KeepaliveTask {
    /// Current interval
    interval: watch::Sender<Option<Duration>>,
    /// Task handle
    task_handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a keep-alive task (but doesn't start it).
    pub fn new(interval: Option<Duration>) -> Self {
        let (interval, _) = watch::channel(interval);
        Self {
            interval,
            task_handle: None,
        }
    }

    /// Starts the keep-alive task.
    ///
    /// # Arguments
    ///
    /// * `send_fn` - sends one keep-alive; an error stops the task
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut task = KeepaliveTask::new(Some(Duration::from_secs(60)));
    /// let sender = sender.clone();
    /// task.start(move || sender.send(keepalive_packet()));
    /// ```
    pub fn start<F>(&mut self, send_fn: F)
    where
        F: Fn() -> TernResult<()> + Send + 'static,
    {
        self.stop_task();
        let mut interval_rx = self.interval.subscribe();

        let handle = tokio::spawn(async move {
            debug!("Keep-alive task started with interval: {:?}", *interval_rx.borrow());

            loop {
                let current = *interval_rx.borrow_and_update();
                match current {
                    Some(interval) => {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {
                                if let Err(e) = send_fn() {
                                    warn!("Keep-alive failed: {} - stopping task", e);
                                    break;
                                }
                                debug!("Keep-alive message sent");
                            }
                            changed = interval_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        if interval_rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }

            debug!("Keep-alive task stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Changes the interval. `None` pauses the heartbeat.
    pub fn set_interval(&self, interval: Option<Duration>) {
        debug!("Keep-alive interval set to {:?}", interval);
        self.interval.send_replace(interval);
    }

    /// Current interval.
    pub fn interval(&self) -> Option<Duration> {
        *self.interval.borrow()
    }

    fn stop_task(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Stops the keep-alive task.
    pub fn stop(&mut self) {
        self.stop_task();
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for KeepaliveTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveTask")
            .field("interval", &self.interval())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Creates the keep-alive packet.
///
/// # Format
///
/// ```text
/// byte    MSG_DEBUG (36)
/// string  "heartbeat"
/// ```
pub fn keepalive_packet() -> Packet {
    let mut packet = Packet::new(MessageType::Debug);
    packet.put_string(HEARTBEAT);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tern_platform::TernError;

    #[test]
    fn test_keepalive_packet_format() {
        let packet = keepalive_packet();
        assert!(packet.is(MessageType::Debug));
        assert_eq!(packet.reader().get_string().unwrap(), HEARTBEAT);
    }

    #[test]
    fn test_keepalive_task_creation() {
        let task = KeepaliveTask::new(Some(Duration::from_secs(60)));
        assert!(!task.is_running());
        assert_eq!(task.interval(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_task_lifecycle() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut task = KeepaliveTask::new(Some(Duration::from_millis(100)));
        task.start(move || {
            counter_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        task.stop();

        let count = counter.load(Ordering::Relaxed);
        assert_eq!(count, 3, "Expected 3 calls, got {}", count);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_interval_adjustable() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut task = KeepaliveTask::new(None);
        task.start(move || {
            counter_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        // Disabled: nothing is sent.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        task.set_interval(Some(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        task.set_interval(None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_task_stops_on_error() {
        let should_fail = Arc::new(AtomicBool::new(false));
        let should_fail_clone = Arc::clone(&should_fail);

        let mut task = KeepaliveTask::new(Some(Duration::from_millis(50)));
        task.start(move || {
            if should_fail_clone.load(Ordering::Relaxed) {
                Err(TernError::Protocol("Simulated error".to_string()))
            } else {
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.is_running());

        should_fail.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_running());
    }
}
