// Renderable registry
//
// Entity id -> GPU resources. Only the streaming thread mutates it; the
// renderer reclaims it after the thread has been joined.

use std::collections::BTreeMap;

use crate::entity::EntityId;

/// GPU resource held for one entity and the vertices it holds
#[derive(Debug)]
pub struct RenderableEntry<B> {
    pub resource: B,
    pub vertex_count: u32,
}

/// Live mapping from entity identity to its draw resources.
///
/// Iteration is ordered by id so recordings are deterministic.
#[derive(Debug)]
pub struct RenderableRegistry<B> {
    entries: BTreeMap<EntityId, RenderableEntry<B>>,
}

impl<B> Default for RenderableRegistry<B> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<B> RenderableRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&RenderableEntry<B>> {
        self.entries.get(&id)
    }

    /// Insert, handing back whatever entry it replaced
    pub fn insert(&mut self, id: EntityId, entry: RenderableEntry<B>) -> Option<RenderableEntry<B>> {
        self.entries.insert(id, entry)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<RenderableEntry<B>> {
        self.entries.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &RenderableEntry<B>)> + '_ {
        self.entries.iter().map(|(&id, entry)| (id, entry))
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entries.keys().copied().collect()
    }

    /// Sum of vertex counts over all entries
    pub fn total_vertex_count(&self) -> u64 {
        self.entries
            .values()
            .map(|entry| u64::from(entry.vertex_count))
            .sum()
    }

    /// Remove every entry, oldest id first
    pub fn drain(&mut self) -> impl Iterator<Item = (EntityId, RenderableEntry<B>)> {
        std::mem::take(&mut self.entries).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(resource: u32, vertex_count: u32) -> RenderableEntry<u32> {
        RenderableEntry {
            resource,
            vertex_count,
        }
    }

    #[test]
    fn insert_remove_and_totals() {
        let mut registry = RenderableRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.insert(EntityId(2), entry(20, 4)).is_none());
        assert!(registry.insert(EntityId(1), entry(10, 3)).is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_vertex_count(), 7);
        assert_eq!(registry.ids(), vec![EntityId(1), EntityId(2)]);

        let removed = registry.remove(EntityId(1)).unwrap();
        assert_eq!(removed.resource, 10);
        assert!(registry.remove(EntityId(1)).is_none());
        assert_eq!(registry.total_vertex_count(), 4);
    }

    #[test]
    fn insert_returns_replaced_entry() {
        let mut registry = RenderableRegistry::new();
        registry.insert(EntityId(5), entry(1, 3));
        let old = registry.insert(EntityId(5), entry(2, 6)).unwrap();
        assert_eq!(old.resource, 1);
        assert_eq!(registry.get(EntityId(5)).unwrap().vertex_count, 6);
    }

    #[test]
    fn drain_empties_registry() {
        let mut registry = RenderableRegistry::new();
        registry.insert(EntityId(1), entry(1, 1));
        registry.insert(EntityId(2), entry(2, 1));
        let drained: Vec<u32> = registry.drain().map(|(_, e)| e.resource).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(registry.is_empty());
    }
}
