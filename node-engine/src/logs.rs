use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Bounded history of recent engine log lines. Never cleared during a
/// process's lifetime; new lines evict the oldest once `capacity` is hit.
pub struct LogRingBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(100)
    }
}

/// A subscriber's view onto an engine's log stream: the backlog captured
/// at subscribe time, followed by everything the broadcaster sends after.
pub struct LogSubscription {
    pub backlog: Vec<String>,
    pub receiver: broadcast::Receiver<String>,
}

/// Fans out engine log lines to every active `StreamBackendLogs` caller.
///
/// Slow or disconnected subscribers are dropped by `broadcast` itself —
/// a lagging receiver just skips ahead rather than backpressuring the
/// log pump, matching the teacher's append-only event-bus behavior.
pub struct LogBroadcaster {
    ring: LogRingBuffer,
    sender: broadcast::Sender<String>,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            ring: LogRingBuffer::new(capacity),
            sender,
        }
    }

    /// Record a line in the backlog and fan it out to current subscribers.
    /// No-op send errors (no subscribers) are expected and ignored.
    pub fn publish(&self, line: String) {
        self.ring.push(line.clone());
        let _ = self.sender.send(line);
    }

    pub fn subscribe(&self) -> LogSubscription {
        LogSubscription {
            backlog: self.ring.snapshot(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let ring = LogRingBuffer::new(2);
        ring.push("a".into());
        ring.push("b".into());
        ring.push("c".into());
        assert_eq!(ring.snapshot(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn subscriber_sees_backlog_then_live_lines() {
        let bus = LogBroadcaster::new(16);
        bus.publish("line-1".into());

        let mut sub = bus.subscribe();
        assert_eq!(sub.backlog, vec!["line-1".to_string()]);

        bus.publish("line-2".into());
        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received, "line-2");
    }
}
