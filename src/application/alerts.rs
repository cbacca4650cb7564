//! Severity-routed alert mailbox. Posting never blocks the trading hot path:
//! the queue is bounded, overflow drops the oldest entry with a log line, and
//! sink failures are logged and swallowed by the delivery task.

use crate::domain::ports::{Alert, AlertSeverity, AlertSink};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{info, warn};

pub struct AlertMailbox {
    queue: Mutex<VecDeque<Alert>>,
    notify: Notify,
    capacity: usize,
}

impl AlertMailbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
        })
    }

    /// Enqueue an alert. Synchronous and lock-only so callers in the trading
    /// hot path never wait on delivery.
    pub fn post(&self, alert: Alert) {
        {
            let mut queue = self.queue.lock().expect("alert queue lock poisoned");
            if queue.len() == self.capacity {
                let dropped = queue.pop_front();
                warn!(
                    "AlertMailbox: overflow, dropping oldest alert: {:?}",
                    dropped.map(|a| a.message)
                );
            }
            queue.push_back(alert);
        }
        self.notify.notify_one();
    }

    pub fn post_info(&self, source: &str, message: impl Into<String>) {
        self.post(Alert::new(AlertSeverity::Info, source, message));
    }

    pub fn post_warning(&self, source: &str, message: impl Into<String>) {
        self.post(Alert::new(AlertSeverity::Warning, source, message));
    }

    pub fn post_critical(&self, source: &str, message: impl Into<String>) {
        self.post(Alert::new(AlertSeverity::Critical, source, message));
    }

    fn drain(&self) -> Vec<Alert> {
        let mut queue = self.queue.lock().expect("alert queue lock poisoned");
        queue.drain(..).collect()
    }

    /// Delivery loop. One task per process; owns the sinks.
    pub async fn run(self: Arc<Self>, sinks: Vec<Arc<dyn AlertSink>>) {
        info!("AlertMailbox: delivery task started ({} sinks)", sinks.len());
        loop {
            self.notify.notified().await;
            for alert in self.drain() {
                for sink in &sinks {
                    if let Err(e) = sink.deliver(&alert).await {
                        // A dead sink must not take down alerting, let alone
                        // trading. Log and move on.
                        warn!("AlertMailbox: sink delivery failed: {e:#}");
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
