//! Item collection and active transfer registrations.
//!
//! Everything here is synchronous and owned by the coordinator task, so
//! no two updates can race.

use std::collections::HashMap;

use reqwest::Url;

use crate::model::{Item, ItemId, ItemState, Snapshot};
use crate::transfer::TransferHandle;

/// Authoritative item state plus the handle-to-item map.
#[derive(Debug, Default)]
pub struct Ledger {
    items: Vec<Item>,
    active: HashMap<TransferHandle, ItemId>,
    generation: u64,
    revision: u64,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registration calls applied so far.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of registered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of transfers with a live registration.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn item(&self, id: &ItemId) -> Option<&Item> {
        self.items.iter().find(|item| &item.id == id)
    }

    fn item_mut(&mut self, id: &ItemId) -> Option<&mut Item> {
        self.items.iter_mut().find(|item| &item.id == id)
    }

    /// Installs a new item list and starts a new generation.
    ///
    /// Returns the registrations of the previous list, which the caller
    /// must either cancel or hand back through [`begin`](Self::begin).
    pub fn replace(&mut self, items: Vec<Item>) -> Vec<(TransferHandle, ItemId)> {
        self.items = items;
        self.generation += 1;
        self.active.drain().collect()
    }

    /// Item that owns `handle`.
    #[must_use]
    pub fn owner(&self, handle: &TransferHandle) -> Option<&ItemId> {
        self.active.get(handle)
    }

    fn is_registered(&self, id: &ItemId) -> bool {
        self.active.values().any(|owner| owner == id)
    }

    /// Finds an item that can take over a transfer of `source`.
    ///
    /// Completed items and items with a registration of their own never
    /// qualify.
    #[must_use]
    pub fn adoptable(&self, source: &Url) -> Option<ItemId> {
        self.items
            .iter()
            .find(|item| {
                &item.source == source
                    && item.state != ItemState::Completed
                    && !self.is_registered(&item.id)
            })
            .map(|item| item.id.clone())
    }

    /// Starts an attempt for `id` owned by `handle`.
    ///
    /// Returns false, changing nothing, if the item is unknown or already
    /// has a live transfer.
    pub fn begin(&mut self, id: &ItemId, handle: TransferHandle) -> bool {
        if self.is_registered(id) {
            return false;
        }
        let Some(item) = self.item_mut(id) else {
            return false;
        };
        item.begin_attempt();
        self.active.insert(handle, id.clone());
        true
    }

    /// Applies a progress report. Returns false for unknown handles.
    pub fn progress(&mut self, handle: &TransferHandle, written: u64, total: Option<u64>) -> bool {
        let Some(id) = self.active.get(handle).cloned() else {
            return false;
        };
        self.item_mut(&id)
            .map(|item| item.record_progress(written, total))
            .is_some()
    }

    /// Removes the registration of a finished transfer and returns its owner.
    pub fn finish(&mut self, handle: &TransferHandle) -> Option<ItemId> {
        self.active.remove(handle)
    }

    /// Removes every registration.
    pub fn drain_active(&mut self) -> Vec<(TransferHandle, ItemId)> {
        self.active.drain().collect()
    }

    pub fn complete(&mut self, id: &ItemId) {
        if let Some(item) = self.item_mut(id) {
            item.mark_completed();
        }
    }

    pub fn fail(&mut self, id: &ItemId) {
        if let Some(item) = self.item_mut(id) {
            item.mark_failed();
        }
    }

    pub fn reset(&mut self, id: &ItemId) {
        if let Some(item) = self.item_mut(id) {
            item.reset();
        }
    }

    /// Builds the next snapshot, bumping the revision.
    pub fn snapshot(&mut self) -> Snapshot {
        self.revision += 1;
        Snapshot {
            generation: self.generation,
            revision: self.revision,
            items: self.items.clone(),
            active_transfers: self.active.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(name: &str) -> Url {
        Url::parse(&format!("https://host/{name}.mp4")).unwrap()
    }

    fn ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.replace(vec![Item::new(0, url("a")), Item::new(1, url("b"))]);
        ledger
    }

    #[test]
    fn replace_bumps_generation_and_returns_registrations() {
        let mut ledger = ledger();
        assert_eq!(ledger.generation(), 1);
        let handle = TransferHandle::new(url("a"));
        assert!(ledger.begin(&0.into(), handle.clone()));

        let previous = ledger.replace(vec![Item::new(0, url("a"))]);
        assert_eq!(previous, vec![(handle, ItemId::from(0))]);
        assert_eq!(ledger.generation(), 2);
        assert_eq!(ledger.active_count(), 0);
    }

    #[test]
    fn one_live_transfer_per_item() {
        let mut ledger = ledger();
        let first = TransferHandle::new(url("a"));
        let second = TransferHandle::new(url("a"));
        assert!(ledger.begin(&0.into(), first.clone()));
        assert!(!ledger.begin(&0.into(), second.clone()));
        assert_eq!(ledger.owner(&first), Some(&ItemId::from(0)));
        assert_eq!(ledger.owner(&second), None);
    }

    #[test]
    fn begin_unknown_item_is_refused() {
        let mut ledger = ledger();
        assert!(!ledger.begin(&"9".into(), TransferHandle::new(url("z"))));
        assert_eq!(ledger.active_count(), 0);
    }

    #[test]
    fn progress_and_finish() {
        let mut ledger = ledger();
        let handle = TransferHandle::new(url("a"));
        ledger.begin(&0.into(), handle.clone());

        assert!(ledger.progress(&handle, 50, Some(100)));
        let item = ledger.item(&0.into()).unwrap();
        assert!((item.progress_fraction - 0.5).abs() < f64::EPSILON);

        assert_eq!(ledger.finish(&handle), Some(ItemId::from(0)));
        assert_eq!(ledger.finish(&handle), None);
        assert!(!ledger.progress(&handle, 60, Some(100)));
    }

    #[test]
    fn adoptable_skips_completed_and_busy_items() {
        let mut ledger = Ledger::new();
        ledger.replace(vec![
            Item::new(0, url("a")),
            Item::new(1, url("a")),
            Item::new(2, url("a")),
        ]);
        ledger.complete(&0.into());
        ledger.begin(&1.into(), TransferHandle::new(url("a")));

        assert_eq!(ledger.adoptable(&url("a")), Some(ItemId::from(2)));
        assert_eq!(ledger.adoptable(&url("b")), None);
    }

    #[test]
    fn snapshot_revision_increases() {
        let mut ledger = ledger();
        let first = ledger.snapshot();
        let second = ledger.snapshot();
        assert_eq!(second.revision, first.revision + 1);
        assert_eq!(second.generation, 1);
        assert_eq!(second.items.len(), 2);
    }

    #[test]
    fn drain_active_empties_registrations() {
        let mut ledger = ledger();
        ledger.begin(&0.into(), TransferHandle::new(url("a")));
        ledger.begin(&1.into(), TransferHandle::new(url("b")));
        assert_eq!(ledger.drain_active().len(), 2);
        assert_eq!(ledger.active_count(), 0);
    }
}
