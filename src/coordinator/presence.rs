use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{Identity, PresenceEntry};

/// Result of changing a user's connection count.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// 0 -> 1
    Joined(PresenceEntry),
    /// 1 -> 0
    Left(PresenceEntry),
    Unchanged { count: usize },
}

/// Reference-counted presence: a user is present while at least one of their
/// connections is live. Counts of zero are removed, never stored.
#[derive(Debug, Default)]
pub struct PresenceLedger {
    counts: HashMap<String, usize>,
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, identity: &Identity, now: DateTime<Utc>) -> Transition {
        let count = self.counts.entry(identity.user_id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Transition::Unchanged { count: *count };
        }

        let entry = PresenceEntry {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            since: now,
        };
        self.entries.insert(entry.user_id.clone(), entry.clone());
        Transition::Joined(entry)
    }

    /// Releasing a user without a live count is a no-op.
    pub fn release(&mut self, user_id: &str) -> Transition {
        let Some(count) = self.counts.get_mut(user_id) else {
            return Transition::Unchanged { count: 0 };
        };
        *count -= 1;
        if *count > 0 {
            return Transition::Unchanged { count: *count };
        }

        self.counts.remove(user_id);
        match self.entries.remove(user_id) {
            Some(entry) => Transition::Left(entry),
            None => Transition::Unchanged { count: 0 },
        }
    }

    pub fn count(&self, user_id: &str) -> usize {
        self.counts.get(user_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Ordered by user id so snapshots are stable.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ada() -> Identity {
        Identity::new("u1", "Ada")
    }

    #[test]
    fn only_the_first_acquire_joins() {
        let mut ledger = PresenceLedger::new();
        let now = Utc::now();

        assert!(matches!(ledger.acquire(&ada(), now), Transition::Joined(ref e) if e.user_id == "u1" && e.since == now));
        assert_eq!(ledger.acquire(&ada(), Utc::now()), Transition::Unchanged { count: 2 });
        assert_eq!(ledger.count("u1"), 2);
        // the entry keeps the time of the first connection
        assert_eq!(ledger.snapshot()[0].since, now);
    }

    #[test]
    fn only_the_last_release_leaves() {
        let mut ledger = PresenceLedger::new();
        ledger.acquire(&ada(), Utc::now());
        ledger.acquire(&ada(), Utc::now());

        assert_eq!(ledger.release("u1"), Transition::Unchanged { count: 1 });
        assert_eq!(ledger.snapshot().len(), 1);
        assert!(matches!(ledger.release("u1"), Transition::Left(ref e) if e.user_id == "u1"));
        assert!(ledger.snapshot().is_empty());
        assert_eq!(ledger.count("u1"), 0);
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn releasing_an_absent_user_never_goes_negative() {
        let mut ledger = PresenceLedger::new();
        assert_eq!(ledger.release("ghost"), Transition::Unchanged { count: 0 });
        ledger.acquire(&ada(), Utc::now());
        ledger.release("u1");
        assert_eq!(ledger.release("u1"), Transition::Unchanged { count: 0 });
        assert_eq!(ledger.count("u1"), 0);
    }
}
