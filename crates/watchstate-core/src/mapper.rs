use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use watchstate_models::State;
use watchstate_store::StateStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapperMetrics {
    pub added: u64,
    pub merged: u64,
    pub dirty: usize,
}

/// In-memory dedup index over an append-only state array.
///
/// Every pointer of a state maps to its slot; an incoming state that collides
/// with any known pointer merges into that slot instead of creating a new
/// one. `commit` flushes dirty slots to the store in a single transaction.
/// One mapper is owned by one orchestrator run and never shared across runs.
pub struct MemoryMapper {
    slots: Vec<State>,
    index: HashMap<String, usize>,
    dirty: HashSet<usize>,
    metrics: MapperMetrics,
}

impl MemoryMapper {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            dirty: HashSet::new(),
            metrics: MapperMetrics::default(),
        }
    }

    /// Preload the current store contents so merges see prior state.
    pub async fn load(store: &StateStore) -> Result<Self> {
        let mut mapper = Self::new();
        let existing = store.since(i64::MIN).await?;
        for state in existing {
            let slot = mapper.slots.len();
            for pointer in state.pointers() {
                mapper.index.insert(pointer, slot);
            }
            mapper.slots.push(state);
        }
        info!(states = mapper.slots.len(), "mapper preloaded from store");
        Ok(mapper)
    }

    /// Ingest one state: dedup by pointer, merge on collision.
    pub fn add(&mut self, state: State) {
        let pointers = state.pointers();
        let slot = pointers.iter().find_map(|p| self.index.get(p).copied());

        match slot {
            Some(slot) => {
                let outcome = self.slots[slot].merge(&state);
                self.metrics.merged += 1;
                if outcome.changed {
                    self.dirty.insert(slot);
                }
                // Merging can add pointers (new backend metadata, new ids).
                for pointer in self.slots[slot].pointers() {
                    self.index.entry(pointer).or_insert(slot);
                }
            }
            None => {
                let slot = self.slots.len();
                for pointer in pointers {
                    self.index.insert(pointer, slot);
                }
                self.slots.push(state);
                self.dirty.insert(slot);
                self.metrics.added += 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &State> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn metrics(&self) -> MapperMetrics {
        MapperMetrics { dirty: self.dirty.len(), ..self.metrics }
    }

    /// Flush dirty slots in one transaction. Returns the flush count.
    pub async fn commit(&mut self, store: &StateStore) -> Result<usize> {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        let mut slots: Vec<usize> = self.dirty.iter().copied().collect();
        slots.sort_unstable();
        let batch: Vec<State> = slots.iter().map(|slot| self.slots[*slot].clone()).collect();

        let outcomes = store.upsert_all(&batch).await?;
        for (slot, outcome) in slots.iter().zip(outcomes) {
            self.slots[*slot].id = outcome.id;
        }
        let flushed = self.dirty.len();
        self.dirty.clear();
        debug!(flushed, "mapper committed");
        Ok(flushed)
    }
}

impl Default for MemoryMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Store-direct variant used by webhook draining: no batch index, each add
/// resolves against the store and upserts immediately. Low latency beats
/// cross-batch dedup there.
pub struct DirectMapper<'a> {
    store: &'a StateStore,
}

impl<'a> DirectMapper<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    pub async fn add(&self, state: State) -> Result<i64> {
        let existing = self.store.find_by_pointers(&state.pointers()).await?;
        let merged = match existing.into_iter().next() {
            Some(mut current) => {
                current.merge(&state);
                current
            }
            None => state,
        };
        let outcome = self.store.upsert(&merged).await?;
        Ok(outcome.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchstate_models::guid::GuidSource;
    use watchstate_models::{BackendMetadata, MediaKind};

    fn movie(via: &str, imdb: &str, updated: i64, watched: bool) -> State {
        let mut state = State::new(MediaKind::Movie, via, "Dune");
        state.guids.insert(GuidSource::Imdb, imdb);
        state.watched = watched;
        state.updated = updated;
        state.metadata.insert(
            via.to_string(),
            BackendMetadata { id: format!("{via}-1"), watched, ..Default::default() },
        );
        state
    }

    #[test]
    fn add_dedups_by_pointer() {
        let mut mapper = MemoryMapper::new();
        mapper.add(movie("home_jellyfin", "tt1160419", 100, true));
        mapper.add(movie("home_plex", "tt1160419", 200, true));
        mapper.add(movie("home_plex", "tt7654321", 50, false));

        assert_eq!(mapper.len(), 2);
        let metrics = mapper.metrics();
        assert_eq!(metrics.added, 2);
        assert_eq!(metrics.merged, 1);

        let dune = mapper.iter().find(|s| s.guids.get(GuidSource::Imdb) == Some("tt1160419")).unwrap();
        assert_eq!(dune.via, "home_plex");
        assert_eq!(dune.metadata.len(), 2);
    }

    #[test]
    fn merge_indexes_new_pointers() {
        let mut mapper = MemoryMapper::new();
        mapper.add(movie("home_jellyfin", "tt1160419", 100, true));
        mapper.add(movie("home_plex", "tt1160419", 200, true));

        // A later report known only by the plex virtual pointer still lands
        // on the same slot.
        let mut by_virtual = State::new(MediaKind::Movie, "home_plex", "Dune");
        by_virtual.updated = 300;
        by_virtual.metadata.insert(
            "home_plex".to_string(),
            BackendMetadata { id: "home_plex-1".to_string(), ..Default::default() },
        );
        mapper.add(by_virtual);
        assert_eq!(mapper.len(), 1);
    }

    #[tokio::test]
    async fn commit_flushes_dirty_slots_once() {
        let store = StateStore::open_in_memory().await.unwrap();
        let mut mapper = MemoryMapper::new();
        mapper.add(movie("home_jellyfin", "tt1160419", 100, true));
        mapper.add(movie("home_plex", "tt7654321", 50, false));

        assert_eq!(mapper.commit(&store).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 2);

        // Nothing dirty: no-op.
        assert_eq!(mapper.commit(&store).await.unwrap(), 0);

        // A merge that changes play state re-dirties exactly one slot.
        mapper.add(movie("home_plex", "tt1160419", 999, false));
        assert_eq!(mapper.commit(&store).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn preloaded_mapper_merges_with_stored_state() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.upsert(&movie("home_jellyfin", "tt1160419", 100, true)).await.unwrap();

        let mut mapper = MemoryMapper::load(&store).await.unwrap();
        mapper.add(movie("home_plex", "tt1160419", 200, true));
        mapper.commit(&store).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store
            .find_by_pointers(&["imdb://tt1160419".to_string()])
            .await
            .unwrap();
        assert_eq!(stored[0].metadata.len(), 2);
        assert_eq!(stored[0].via, "home_plex");
    }

    #[tokio::test]
    async fn direct_mapper_merges_against_store() {
        let store = StateStore::open_in_memory().await.unwrap();
        let direct = DirectMapper::new(&store);

        let id1 = direct.add(movie("home_jellyfin", "tt1160419", 100, false)).await.unwrap();
        let id2 = direct.add(movie("home_plex", "tt1160419", 200, true)).await.unwrap();
        assert_eq!(id1, id2);

        let stored = store.get(id1).await.unwrap().unwrap();
        assert!(stored.watched);
        assert_eq!(stored.metadata.len(), 2);
    }
}
