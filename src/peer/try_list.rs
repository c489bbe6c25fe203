//! Endpoint try-list.
//!
//! When a peer stops answering, the device walks a list of candidate URLs
//! for it. Candidates come from two places: the super's peer list
//! (replaced wholesale on every update) and `BroadcastPeer` announcements
//! from other edges (added one at a time, evicted once they have had
//! their chance).

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct TryItem {
    /// Lower values are tried first among never-tried candidates.
    priority: f64,
    last_try: Option<Instant>,
    first_try: Option<Instant>,
}

impl TryItem {
    fn new(priority: f64, last_try: Option<Instant>) -> Self {
        Self {
            priority,
            last_try,
            first_try: None,
        }
    }

    fn sort_key(&self) -> (Option<Instant>, f64) {
        (self.last_try, self.priority)
    }
}

/// Candidate endpoints for one peer.
#[derive(Debug)]
pub struct TryList {
    /// How long a candidate counts as freshly tried.
    timeout: Duration,
    from_super: HashMap<String, TryItem>,
    from_p2p: HashMap<String, TryItem>,
}

impl TryList {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            from_super: HashMap::new(),
            from_p2p: HashMap::new(),
        }
    }

    /// Replace the super-provided candidates, keeping the timestamps of
    /// URLs that survive.
    pub fn update_super<I>(&mut self, urls: I)
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let mut next = HashMap::new();
        for (url, priority) in urls {
            if url.is_empty() {
                continue;
            }
            let item = match self.from_super.remove(&url) {
                Some(existing) => existing,
                None => TryItem::new(priority, None),
            };
            next.insert(url, item);
        }
        self.from_super = next;
    }

    /// Add a candidate announced by another edge.
    pub fn update_p2p(&mut self, url: &str, now: Instant) {
        if url.is_empty() {
            return;
        }
        self.from_p2p
            .entry(url.to_string())
            .or_insert_with(|| TryItem::new(0.0, Some(now)));
    }

    /// Forget a candidate that failed to resolve or bind.
    pub fn delete(&mut self, url: &str) {
        self.from_super.remove(url);
        self.from_p2p.remove(url);
    }

    /// Pick the least recently tried candidate and stamp it.
    ///
    /// Returns `(fast_try, url)`. `fast_try` is true while the candidate is
    /// still inside its first timeout window, meaning the caller should
    /// probe it eagerly.
    pub fn next_try(&mut self, now: Instant) -> Option<(bool, String)> {
        let timeout = self.timeout;
        self.from_p2p.retain(|_, item| {
            item.first_try
                .map_or(true, |first| now <= first + timeout)
        });

        let best = self
            .from_super
            .iter()
            .chain(self.from_p2p.iter())
            .min_by(|(_, a), (_, b)| {
                a.sort_key()
                    .partial_cmp(&b.sort_key())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(url, _)| url.clone())?;

        let item = match self.from_super.get_mut(&best) {
            Some(item) => item,
            None => self.from_p2p.get_mut(&best)?,
        };
        item.last_try = Some(now);
        let first = *item.first_try.get_or_insert(now);
        Some((now <= first + timeout, best))
    }

    pub fn len(&self) -> usize {
        self.from_super.len() + self.from_p2p.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(20);

    #[test]
    fn test_empty_list_has_nothing_to_try() {
        let mut list = TryList::new(TIMEOUT);
        assert!(list.next_try(Instant::now()).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_super_candidates_by_priority_then_rotation() {
        let mut list = TryList::new(TIMEOUT);
        list.update_super(vec![
            ("192.0.2.1:3001".to_string(), 6.0),
            ("192.0.2.2:3001".to_string(), 4.0),
        ]);
        let now = Instant::now();
        let (fast, url) = list.next_try(now).unwrap();
        assert!(fast);
        assert_eq!(url, "192.0.2.2:3001");

        // The other one has never been tried, so it comes next
        let (_, url) = list.next_try(now + Duration::from_secs(1)).unwrap();
        assert_eq!(url, "192.0.2.1:3001");

        // Then back to the least recently tried
        let (_, url) = list.next_try(now + Duration::from_secs(2)).unwrap();
        assert_eq!(url, "192.0.2.2:3001");
    }

    #[test]
    fn test_fast_try_ends_after_timeout() {
        let mut list = TryList::new(TIMEOUT);
        list.update_super(vec![("192.0.2.1:1".to_string(), 4.0)]);
        let now = Instant::now();
        assert!(list.next_try(now).unwrap().0);
        let (fast, _) = list.next_try(now + TIMEOUT + Duration::from_secs(1)).unwrap();
        assert!(!fast);
    }

    #[test]
    fn test_super_update_keeps_timestamps() {
        let mut list = TryList::new(TIMEOUT);
        let now = Instant::now();
        list.update_super(vec![("a:1".to_string(), 1.0), ("b:1".to_string(), 2.0)]);
        assert_eq!(list.next_try(now).unwrap().1, "a:1");

        list.update_super(vec![("a:1".to_string(), 1.0), ("c:1".to_string(), 3.0)]);
        assert_eq!(list.len(), 2);
        // a was tried already, c was not
        assert_eq!(list.next_try(now).unwrap().1, "c:1");
    }

    #[test]
    fn test_p2p_candidate_evicted_after_window() {
        let mut list = TryList::new(TIMEOUT);
        let now = Instant::now();
        list.update_p2p("198.51.100.7:3000", now);
        assert_eq!(list.next_try(now).unwrap().1, "198.51.100.7:3000");

        let later = now + TIMEOUT + Duration::from_secs(1);
        assert!(list.next_try(later).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_p2p_does_not_duplicate_and_delete() {
        let mut list = TryList::new(TIMEOUT);
        let now = Instant::now();
        list.update_p2p("x:1", now);
        list.update_p2p("x:1", now);
        assert_eq!(list.len(), 1);
        list.delete("x:1");
        assert!(list.is_empty());
    }
}
