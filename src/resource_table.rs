// src/resource_table.rs
//! Resource table: the authoritative set of live managed lights.
//! - Primary map: handle -> record
//! - Entity index: owning entity -> handle (secondary view, never a second source of truth)
//! - Swaps re-key the record in place so the entity linkage survives recreate-on-update
//!
//! Not synchronized on its own; the light manager owns it behind its state lock.

use std::collections::HashMap;
use std::time::Instant;

use crate::backend::LightHandle;
use crate::light::{EntityId, LightProperties};

/// One live light. Owned exclusively by the table.
#[derive(Debug, Clone)]
pub struct ManagedLight {
    pub handle: LightHandle,
    pub properties: LightProperties,
    pub owning_entity: Option<EntityId>,
    pub last_update: Instant,
    /// A deferred update targets this light and has not been flushed yet.
    pub needs_update: bool,
    pub update_count: u32,
}

/// Entity index entry as seen by the GC snapshot.
#[derive(Debug, Clone, Copy)]
pub struct EntityEntry {
    pub entity: EntityId,
    pub handle: LightHandle,
    pub last_update: Instant,
}

#[derive(Default)]
pub struct ResourceTable {
    lights: HashMap<LightHandle, ManagedLight>,
    by_entity: HashMap<EntityId, LightHandle>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lights: HashMap::with_capacity(capacity),
            by_entity: HashMap::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    #[inline]
    pub fn entity_count(&self) -> usize {
        self.by_entity.len()
    }

    #[inline]
    pub fn contains(&self, handle: LightHandle) -> bool {
        self.lights.contains_key(&handle)
    }

    #[inline]
    pub fn get(&self, handle: LightHandle) -> Option<&ManagedLight> {
        self.lights.get(&handle)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: LightHandle) -> Option<&mut ManagedLight> {
        self.lights.get_mut(&handle)
    }

    #[inline]
    pub fn handle_for_entity(&self, entity: EntityId) -> Option<LightHandle> {
        self.by_entity.get(&entity).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedLight> {
        self.lights.values()
    }

    /// Register a freshly created light. The caller has already checked the entity
    /// is free; a handle the backend hands out twice is a backend bug.
    pub fn insert(&mut self, light: ManagedLight) {
        let handle = light.handle;
        if let Some(entity) = light.owning_entity {
            if let Some(previous) = self.by_entity.insert(entity, handle) {
                log::error!(
                    "entity {} already owned light {}, index now points at {}",
                    entity,
                    previous,
                    handle
                );
            }
        }
        if self.lights.insert(handle, light).is_some() {
            log::error!("backend reissued live light handle {}", handle);
        }
        self.debug_check();
    }

    /// Remove a light from the table and the entity index.
    pub fn remove(&mut self, handle: LightHandle) -> Option<ManagedLight> {
        let light = self.lights.remove(&handle)?;
        if let Some(entity) = light.owning_entity {
            if self.by_entity.get(&entity) == Some(&handle) {
                self.by_entity.remove(&entity);
            }
        }
        self.debug_check();
        Some(light)
    }

    /// Splice a recreated backend light into the record of `old`.
    /// Entity linkage and creation time are preserved; `last_update` never moves backwards.
    pub fn swap(
        &mut self,
        old: LightHandle,
        new: LightHandle,
        properties: LightProperties,
        now: Instant,
    ) -> Option<&ManagedLight> {
        let mut light = self.lights.remove(&old)?;
        light.handle = new;
        light.properties = properties;
        light.last_update = light.last_update.max(now);
        light.needs_update = false;
        light.update_count = light.update_count.saturating_add(1);

        if let Some(entity) = light.owning_entity {
            self.by_entity.insert(entity, new);
        }
        self.lights.insert(new, light);
        self.debug_check();
        self.lights.get(&new)
    }

    /// Snapshot of the entity index for the GC pass.
    pub fn entity_entries(&self) -> Vec<EntityEntry> {
        self.by_entity
            .iter()
            .filter_map(|(&entity, &handle)| {
                self.lights.get(&handle).map(|light| EntityEntry {
                    entity,
                    handle,
                    last_update: light.last_update,
                })
            })
            .collect()
    }

    /// Empty the table, returning every record (shutdown path).
    pub fn drain(&mut self) -> Vec<ManagedLight> {
        self.by_entity.clear();
        self.lights.drain().map(|(_, light)| light).collect()
    }

    /// Every index entry has a matching light owned by that entity.
    pub fn is_consistent(&self) -> bool {
        self.by_entity.iter().all(|(entity, handle)| {
            self.lights
                .get(handle)
                .is_some_and(|light| light.owning_entity == Some(*entity))
        }) && self
            .lights
            .values()
            .filter_map(|light| light.owning_entity.map(|e| (e, light.handle)))
            .all(|(entity, handle)| self.by_entity.get(&entity) == Some(&handle))
    }

    #[inline]
    fn debug_check(&self) {
        debug_assert!(self.is_consistent(), "entity index diverged from resource table");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn handle(raw: u64) -> LightHandle {
        LightHandle::from_raw(raw).unwrap()
    }

    fn props(size: f32) -> LightProperties {
        LightProperties::new(Vec3::ZERO, size, 1.0, Vec3::ONE).unwrap()
    }

    fn light(raw: u64, entity: Option<u64>) -> ManagedLight {
        let now = Instant::now();
        ManagedLight {
            handle: handle(raw),
            properties: props(10.0),
            owning_entity: entity.map(EntityId),
            last_update: now,
            needs_update: false,
            update_count: 0,
        }
    }

    #[test]
    fn insert_and_remove_keep_index_in_sync() {
        let mut table = ResourceTable::new();
        table.insert(light(1, Some(42)));
        table.insert(light(2, None));

        assert_eq!(table.len(), 2);
        assert_eq!(table.entity_count(), 1);
        assert_eq!(table.handle_for_entity(EntityId(42)), Some(handle(1)));

        let removed = table.remove(handle(1)).unwrap();
        assert_eq!(removed.owning_entity, Some(EntityId(42)));
        assert_eq!(table.handle_for_entity(EntityId(42)), None);
        assert!(table.remove(handle(1)).is_none());
        assert!(table.is_consistent());
    }

    #[test]
    fn swap_rekeys_and_preserves_entity() {
        let mut table = ResourceTable::new();
        table.insert(light(1, Some(7)));
        let before = table.get(handle(1)).unwrap().last_update;

        let swapped = table
            .swap(handle(1), handle(2), props(20.0), Instant::now())
            .unwrap();
        assert_eq!(swapped.handle, handle(2));
        assert_eq!(swapped.properties.size(), 20.0);
        assert_eq!(swapped.update_count, 1);
        assert!(swapped.last_update >= before);

        assert!(!table.contains(handle(1)));
        assert_eq!(table.handle_for_entity(EntityId(7)), Some(handle(2)));
        assert!(table.is_consistent());
    }

    #[test]
    fn swap_of_unknown_handle_is_none() {
        let mut table = ResourceTable::new();
        assert!(table
            .swap(handle(9), handle(10), props(1.0), Instant::now())
            .is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn last_update_never_moves_backwards() {
        let mut table = ResourceTable::new();
        let earlier = Instant::now();
        table.insert(light(1, None));
        let recorded = table.get(handle(1)).unwrap().last_update;
        let swapped = table.swap(handle(1), handle(2), props(3.0), earlier).unwrap();
        assert_eq!(swapped.last_update, recorded);
    }

    #[test]
    fn entity_entries_only_cover_owned_lights() {
        let mut table = ResourceTable::new();
        table.insert(light(1, Some(1)));
        table.insert(light(2, Some(2)));
        table.insert(light(3, None));

        let mut entities: Vec<u64> = table.entity_entries().iter().map(|e| e.entity.0).collect();
        entities.sort_unstable();
        assert_eq!(entities, vec![1, 2]);

        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
        assert_eq!(table.entity_count(), 0);
    }
}
