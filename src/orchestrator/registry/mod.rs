use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::jobs::{Priority, PRIORITY_TIERS};
use super::ConnectionId;

#[derive(Clone, Debug, PartialEq, Eq)]
struct PendingEntry {
    sequence: u64,
    handle: String,
}

/// Head of a function's queue as seen by the matcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueHead {
    pub tier: usize,
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct FunctionEntry {
    capable: BTreeSet<ConnectionId>,
    idle: BTreeSet<ConnectionId>,
    pending: [VecDeque<PendingEntry>; PRIORITY_TIERS],
}

impl FunctionEntry {
    fn pending_len(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    fn is_vacant(&self) -> bool {
        self.capable.is_empty() && self.idle.is_empty() && self.pending_len() == 0
    }
}

/// Per-function view of who can run what and what is waiting to run.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the worker was already capable.
    pub fn register(&mut self, function_name: &str, worker: ConnectionId) -> bool {
        self.functions
            .entry(function_name.to_owned())
            .or_default()
            .capable
            .insert(worker)
    }

    pub fn unregister(&mut self, function_name: &str, worker: ConnectionId) {
        if let Some(entry) = self.functions.get_mut(function_name) {
            entry.capable.remove(&worker);
            entry.idle.remove(&worker);
        }
        self.prune(function_name);
    }

    pub fn is_capable(&self, function_name: &str, worker: ConnectionId) -> bool {
        self.functions
            .get(function_name)
            .is_some_and(|entry| entry.capable.contains(&worker))
    }

    pub fn mark_idle(&mut self, function_name: &str, worker: ConnectionId) {
        if !self.is_capable(function_name, worker) {
            return;
        }
        if let Some(entry) = self.functions.get_mut(function_name) {
            entry.idle.insert(worker);
        }
    }

    pub fn clear_idle(&mut self, function_name: &str, worker: ConnectionId) {
        if let Some(entry) = self.functions.get_mut(function_name) {
            entry.idle.remove(&worker);
        }
    }

    /// Idle workers for the function in connection order.
    pub fn idle_workers(&self, function_name: &str) -> Vec<ConnectionId> {
        self.functions
            .get(function_name)
            .map(|entry| entry.idle.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn capable_workers(&self, function_name: &str) -> usize {
        self.functions
            .get(function_name)
            .map_or(0, |entry| entry.capable.len())
    }

    pub fn push_back(&mut self, function_name: &str, priority: Priority, sequence: u64, handle: &str) {
        self.functions
            .entry(function_name.to_owned())
            .or_default()
            .pending[priority.tier()]
            .push_back(PendingEntry {
                sequence,
                handle: handle.to_owned(),
            });
    }

    /// Requeued jobs go ahead of everything else in their tier.
    pub fn push_front(&mut self, function_name: &str, priority: Priority, sequence: u64, handle: &str) {
        self.functions
            .entry(function_name.to_owned())
            .or_default()
            .pending[priority.tier()]
            .push_front(PendingEntry {
                sequence,
                handle: handle.to_owned(),
            });
    }

    pub fn head(&self, function_name: &str) -> Option<QueueHead> {
        let entry = self.functions.get(function_name)?;
        entry
            .pending
            .iter()
            .enumerate()
            .find_map(|(tier, queue)| {
                queue.front().map(|pending| QueueHead {
                    tier,
                    sequence: pending.sequence,
                })
            })
    }

    pub fn pop_head(&mut self, function_name: &str) -> Option<String> {
        let entry = self.functions.get_mut(function_name)?;
        let handle = entry
            .pending
            .iter_mut()
            .find_map(VecDeque::pop_front)
            .map(|pending| pending.handle);
        self.prune(function_name);
        handle
    }

    pub fn has_pending(&self, function_name: &str) -> bool {
        self.head(function_name).is_some()
    }

    pub fn pending_len(&self, function_name: &str) -> usize {
        self.functions
            .get(function_name)
            .map_or(0, FunctionEntry::pending_len)
    }

    pub fn pending_by_function(&self) -> BTreeMap<String, usize> {
        self.functions
            .iter()
            .map(|(name, entry)| (name.clone(), entry.pending_len()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    fn prune(&mut self, function_name: &str) {
        if self
            .functions
            .get(function_name)
            .is_some_and(FunctionEntry::is_vacant)
        {
            self.functions.remove(function_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FunctionRegistry, QueueHead};
    use crate::orchestrator::jobs::Priority;

    #[test]
    fn pending_queue_orders_by_tier_then_fifo() {
        let mut registry = FunctionRegistry::new();
        registry.push_back("reverse", Priority::Normal, 1, "H:a:1");
        registry.push_back("reverse", Priority::High, 2, "H:a:2");
        registry.push_back("reverse", Priority::Normal, 3, "H:a:3");
        registry.push_back("reverse", Priority::Low, 4, "H:a:4");

        assert_eq!(registry.head("reverse"), Some(QueueHead { tier: 0, sequence: 2 }));
        let order = std::iter::from_fn(|| registry.pop_head("reverse")).collect::<Vec<_>>();
        assert_eq!(order, vec!["H:a:2", "H:a:1", "H:a:3", "H:a:4"]);
        assert!(registry.function_names().is_empty());
    }

    #[test]
    fn push_front_jumps_its_own_tier_only() {
        let mut registry = FunctionRegistry::new();
        registry.push_back("resize", Priority::High, 5, "H:a:5");
        registry.push_back("resize", Priority::Normal, 6, "H:a:6");
        registry.push_front("resize", Priority::Normal, 1, "H:a:1");

        assert_eq!(registry.pop_head("resize").as_deref(), Some("H:a:5"));
        assert_eq!(registry.pop_head("resize").as_deref(), Some("H:a:1"));
        assert_eq!(registry.pop_head("resize").as_deref(), Some("H:a:6"));
    }

    #[test]
    fn idle_requires_capability() {
        let mut registry = FunctionRegistry::new();
        registry.mark_idle("reverse", 1);
        assert!(registry.idle_workers("reverse").is_empty());

        assert!(registry.register("reverse", 3));
        assert!(!registry.register("reverse", 3));
        assert!(registry.register("reverse", 1));
        registry.mark_idle("reverse", 3);
        registry.mark_idle("reverse", 1);
        assert_eq!(registry.idle_workers("reverse"), vec![1, 3]);
        assert_eq!(registry.capable_workers("reverse"), 2);

        registry.clear_idle("reverse", 1);
        assert_eq!(registry.idle_workers("reverse"), vec![3]);

        registry.unregister("reverse", 3);
        registry.unregister("reverse", 1);
        assert!(!registry.is_capable("reverse", 3));
        assert!(registry.function_names().is_empty());
    }

    #[test]
    fn vacant_functions_keep_pending_jobs() {
        let mut registry = FunctionRegistry::new();
        registry.register("thumbnail", 9);
        registry.push_back("thumbnail", Priority::Low, 1, "H:a:1");
        registry.unregister("thumbnail", 9);

        assert_eq!(registry.pending_len("thumbnail"), 1);
        assert_eq!(
            registry.pending_by_function().get("thumbnail").copied(),
            Some(1)
        );
    }
}
