//! Event subscription set
//!
//! Ordered list of topic prefixes a module has asked to receive as events.
//! Duplicates are allowed (subscriptions are reference counted by repeated
//! entry); one unsubscribe removes one matching entry.

use std::sync::Mutex;

pub struct SubscriptionSet {
    topics: Mutex<Vec<String>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, topic: &str) {
        self.topics.lock().unwrap().push(topic.to_string());
    }

    /// Remove the first entry equal to `topic`; absent topics are a no-op.
    pub fn unsubscribe(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(pos) = topics.iter().position(|t| t == topic) {
            topics.remove(pos);
        }
    }

    /// True when any subscription is a prefix of `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        self.topics
            .lock()
            .unwrap()
            .iter()
            .any(|sub| topic.starts_with(sub.as_str()))
    }

    pub fn len(&self) -> usize {
        self.topics.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.topics.lock().unwrap().clear();
    }
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching() {
        let subs = SubscriptionSet::new();
        subs.subscribe("job.");
        subs.subscribe("log.");
        assert!(subs.matches("job.state.RUN"));
        assert!(subs.matches("log.append"));
        assert!(!subs.matches("kvs.commit"));
        // Exact prefix is a match too.
        assert!(subs.matches("job."));
    }

    #[test]
    fn test_empty_prefix_matches_everything() {
        let subs = SubscriptionSet::new();
        subs.subscribe("");
        assert!(subs.matches("anything"));
    }

    #[test]
    fn test_duplicates_and_single_removal() {
        let subs = SubscriptionSet::new();
        subs.subscribe("hb");
        subs.subscribe("hb");
        assert_eq!(subs.len(), 2);
        subs.unsubscribe("hb");
        assert!(subs.matches("hb"));
        subs.unsubscribe("hb");
        assert!(!subs.matches("hb"));
        subs.unsubscribe("hb");
        assert!(subs.is_empty());
    }
}
