//! Reliable requests awaiting a receive acknowledgment.

use crate::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use switchwire_core::MessageType;
use tokio::time::Instant;

/// Timeout and retry parameters of a reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// How long to wait for an ack before retransmitting.
    #[serde(with = "switchwire_core::serde_duration")]
    pub timeout: Duration,
    pub max_retries: u32,
    /// Pause after a retransmission before the next timeout starts.
    #[serde(with = "switchwire_core::serde_duration")]
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            timeout,
            max_retries,
            retry_delay,
        }
    }

    /// Three retries, two seconds apart.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, 3, Duration::from_secs(2))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }
}

/// One in-flight reliable request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub message_type: MessageType,
    pub send_time: Instant,
    pub timeout: Duration,
    pub max_retries: u32,
    pub current_retry: u32,
    pub retry_delay: Duration,
    /// The serialized envelope, retransmitted unchanged.
    pub original: String,
}

impl PendingRequest {
    pub fn new(
        request_id: String,
        message_type: MessageType,
        original: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            request_id,
            message_type,
            send_time: Instant::now(),
            timeout: policy.timeout,
            max_retries: policy.max_retries,
            current_retry: 0,
            retry_delay: policy.retry_delay,
            original,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.current_retry >= self.max_retries
    }
}

/// Request ID to pending request, guarded by its own lock.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request. Returns false if the ID is already tracked, in which
    /// case the existing entry is kept.
    pub fn insert(&self, request: PendingRequest) -> bool {
        let mut map = lock(&self.inner);
        if map.contains_key(&request.request_id) {
            return false;
        }
        map.insert(request.request_id.clone(), request);
        true
    }

    pub fn get(&self, request_id: &str) -> Option<PendingRequest> {
        lock(&self.inner).get(request_id).cloned()
    }

    pub fn remove(&self, request_id: &str) -> Option<PendingRequest> {
        lock(&self.inner).remove(request_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        lock(&self.inner).contains_key(request_id)
    }

    /// Count one more retry; returns the new count if the entry still exists.
    pub fn bump_retry(&self, request_id: &str) -> Option<u32> {
        lock(&self.inner).get_mut(request_id).map(|req| {
            req.current_retry += 1;
            req.current_retry
        })
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut map = lock(&self.inner);
        let count = map.len();
        map.clear();
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: &str) -> PendingRequest {
        PendingRequest::new(
            id.to_string(),
            MessageType::SwitchFull,
            "{}".to_string(),
            RetryPolicy::new(Duration::from_millis(100), 2, Duration::from_millis(10)),
        )
    }

    #[test]
    fn at_most_one_entry_per_id() {
        let pending = PendingRequests::new();
        assert!(pending.insert(req("a")));
        pending.bump_retry("a");
        assert!(!pending.insert(req("a")));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get("a").unwrap().current_retry, 1);
    }

    #[test]
    fn retry_accounting() {
        let pending = PendingRequests::new();
        pending.insert(req("a"));
        assert_eq!(pending.bump_retry("a"), Some(1));
        assert!(!pending.get("a").unwrap().retries_exhausted());
        assert_eq!(pending.bump_retry("a"), Some(2));
        assert!(pending.get("a").unwrap().retries_exhausted());
        assert_eq!(pending.bump_retry("missing"), None);
    }

    #[test]
    fn remove_and_clear() {
        let pending = PendingRequests::new();
        pending.insert(req("a"));
        pending.insert(req("b"));
        pending.insert(req("c"));
        assert!(pending.remove("b").is_some());
        assert!(pending.remove("b").is_none());
        assert!(!pending.contains("b"));
        assert_eq!(pending.clear(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn policy_from_config() {
        let p: RetryPolicy = serde_json::from_str(r#"{"timeout":500,"max_retries":5}"#).unwrap();
        assert_eq!(p.timeout, Duration::from_millis(500));
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.retry_delay, Duration::from_secs(2));
    }
}
