//! Ordered registry of tracked probe process ids.
//!
//! Owned by the supervisor's main context. Signal handlers never see it.

use std::collections::TryReserveError;

use nix::unistd::Pid;

/// Slots allocated by the first growth step.
pub const INITIAL_CAPACITY: usize = 8;

/// Probe ids in spawn order, without duplicates.
#[derive(Debug)]
pub struct ChildRegistry {
    pids: Vec<Pid>,
    initial_capacity: usize,
}

impl Default for ChildRegistry {
    fn default() -> Self {
        Self::with_initial_capacity(INITIAL_CAPACITY)
    }
}

impl ChildRegistry {
    pub fn with_initial_capacity(initial_capacity: usize) -> Self {
        Self {
            pids: Vec::new(),
            initial_capacity: initial_capacity.max(1),
        }
    }

    /// Append `pid`, doubling the storage when full.
    ///
    /// Allocation failure is returned instead of aborting so the caller can
    /// deal with the live process it was about to track.
    pub fn push(&mut self, pid: Pid) -> Result<(), TryReserveError> {
        debug_assert!(!self.contains(pid), "duplicate pid {pid}");
        if self.pids.len() == self.pids.capacity() {
            let additional = self.pids.capacity().max(self.initial_capacity);
            self.pids.try_reserve_exact(additional)?;
        }
        self.pids.push(pid);
        Ok(())
    }

    /// Remove the entry at `index`, shifting later entries down.
    pub fn remove_at(&mut self, index: usize) -> Option<Pid> {
        (index < self.pids.len()).then(|| self.pids.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<Pid> {
        self.pids.get(index).copied()
    }

    pub fn last(&self) -> Option<Pid> {
        self.pids.last().copied()
    }

    pub fn position(&self, pid: Pid) -> Option<usize> {
        self.pids.iter().position(|tracked| *tracked == pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.position(pid).is_some()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.pids.capacity()
    }

    pub fn as_slice(&self) -> &[Pid] {
        &self.pids
    }

    /// Drop all entries and free the storage. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.pids = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pids(raw: &[i32]) -> Vec<Pid> {
        raw.iter().copied().map(Pid::from_raw).collect()
    }

    #[test]
    fn push_keeps_spawn_order() {
        let mut registry = ChildRegistry::default();
        for raw in [30, 10, 20] {
            registry.push(Pid::from_raw(raw)).expect("push");
        }
        assert_eq!(registry.as_slice(), pids(&[30, 10, 20]).as_slice());
        assert_eq!(registry.last(), Some(Pid::from_raw(20)));
    }

    #[test]
    fn storage_grows_geometrically() {
        let mut registry = ChildRegistry::default();
        registry.push(Pid::from_raw(1)).expect("push");
        assert!(registry.capacity() >= INITIAL_CAPACITY);

        for raw in 2..=(INITIAL_CAPACITY as i32 + 1) {
            registry.push(Pid::from_raw(raw)).expect("push");
        }
        assert!(registry.capacity() >= 2 * INITIAL_CAPACITY);
        assert_eq!(registry.len(), INITIAL_CAPACITY + 1);
    }

    #[test]
    fn remove_shifts_later_entries_down() {
        let mut registry = ChildRegistry::default();
        for raw in [1, 2, 3, 4] {
            registry.push(Pid::from_raw(raw)).expect("push");
        }

        assert_eq!(registry.remove_at(1), Some(Pid::from_raw(2)));
        assert_eq!(registry.as_slice(), pids(&[1, 3, 4]).as_slice());
        assert_eq!(registry.remove_at(3), None);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn release_is_idempotent() {
        let mut registry = ChildRegistry::default();
        registry.push(Pid::from_raw(9)).expect("push");

        registry.release();
        registry.release();

        assert!(registry.is_empty());
        assert_eq!(registry.capacity(), 0);
    }
}
