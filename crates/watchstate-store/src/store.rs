use crate::db::{open_pool, StoreConfig};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, warn};
use watchstate_models::{MediaKind, State};

/// Typed persistence for [`State`] records.
///
/// Writes are serialized by SQLite's write lock (WAL mode); readers run
/// concurrently. The pointer side table is maintained inside the same
/// transaction as the row it indexes.
#[derive(Clone)]
pub struct StateStore {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub created: bool,
}

/// Filters for [`StateStore::page`].
#[derive(Debug, Clone, Default)]
pub struct PageFilter {
    pub kind: Option<MediaKind>,
    pub via: Option<String>,
    /// Only states carrying a metadata entry for this backend.
    pub backend: Option<String>,
    pub watched: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageSort {
    #[default]
    UpdatedDesc,
    UpdatedAsc,
    IdAsc,
}

impl PageSort {
    fn sql(&self) -> &'static str {
        match self {
            PageSort::UpdatedDesc => "updated DESC, id DESC",
            PageSort::UpdatedAsc => "updated ASC, id ASC",
            PageSort::IdAsc => "id ASC",
        }
    }
}

impl StateStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn open(config: StoreConfig) -> Result<Self> {
        Ok(Self::new(open_pool(config).await?))
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory()).await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn get(&self, id: i64) -> Result<Option<State>> {
        let row = sqlx::query("SELECT * FROM state WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_state(&r)).transpose()
    }

    /// Resolve states by any of the given pointer strings.
    pub async fn find_by_pointers(&self, pointers: &[String]) -> Result<Vec<State>> {
        if pointers.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; pointers.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT s.* FROM state s \
             JOIN pointer p ON p.state_id = s.id \
             WHERE p.pointer IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for pointer in pointers {
            query = query.bind(pointer);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_state).collect()
    }

    /// Insert or update a record and refresh its pointer index.
    ///
    /// When `state.id` is zero the pointer table decides whether the record
    /// already exists; that keeps the webhook path from creating duplicates.
    pub async fn upsert(&self, state: &State) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_in_tx(&mut tx, state).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Flush a batch in one transaction. Used by the mapper's commit.
    pub async fn upsert_all(&self, states: &[State]) -> Result<Vec<UpsertOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(states.len());
        for state in states {
            outcomes.push(upsert_in_tx(&mut tx, state).await?);
        }
        tx.commit().await?;
        debug!(count = states.len(), "flushed state batch");
        Ok(outcomes)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM state WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM state")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// States with `updated > since`, oldest first. Drives export.
    pub async fn since(&self, since: i64) -> Result<Vec<State>> {
        let rows = sqlx::query("SELECT * FROM state WHERE updated > ? ORDER BY updated ASC, id ASC")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_state).collect()
    }

    pub async fn page(
        &self,
        filter: &PageFilter,
        sort: PageSort,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<State>, i64)> {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(kind) = filter.kind {
            clauses.push("kind = ?".to_string());
            binds.push(kind.as_str().to_string());
        }
        if let Some(via) = &filter.via {
            clauses.push("via = ?".to_string());
            binds.push(via.clone());
        }
        if let Some(backend) = &filter.backend {
            clauses.push("json_extract(metadata, '$.\"' || ? || '\"') IS NOT NULL".to_string());
            binds.push(backend.clone());
        }
        if let Some(watched) = filter.watched {
            clauses.push("watched = ?".to_string());
            binds.push(if watched { "1" } else { "0" }.to_string());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) AS n FROM state {where_sql}");
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("n");

        let data_sql = format!(
            "SELECT * FROM state {where_sql} ORDER BY {} LIMIT ? OFFSET ?",
            sort.sql()
        );
        let mut data_query = sqlx::query(&data_sql);
        for bind in &binds {
            data_query = data_query.bind(bind);
        }
        data_query = data_query.bind(limit).bind(offset);
        let rows = data_query.fetch_all(&self.pool).await?;
        let states = rows.iter().map(row_to_state).collect::<Result<Vec<_>>>()?;

        Ok((states, total))
    }

    /// States acknowledged by fewer than `min_backends` backends.
    pub async fn parity(&self, min_backends: i64) -> Result<Vec<State>> {
        let rows = sqlx::query(
            "SELECT * FROM state \
             WHERE (SELECT COUNT(*) FROM json_each(state.metadata)) < ? \
             ORDER BY id ASC",
        )
        .bind(min_backends)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_state).collect()
    }

    /// Administrative delete of parity stragglers. Normal sync never deletes.
    pub async fn prune_parity(&self, min_backends: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM state \
             WHERE (SELECT COUNT(*) FROM json_each(state.metadata)) < ?",
        )
        .bind(min_backends)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn upsert_in_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    state: &State,
) -> Result<UpsertOutcome> {
    let pointers = state.pointers();

    let existing_id = if state.id > 0 {
        Some(state.id)
    } else if pointers.is_empty() {
        None
    } else {
        let placeholders = vec!["?"; pointers.len()].join(", ");
        let sql = format!("SELECT state_id FROM pointer WHERE pointer IN ({placeholders}) LIMIT 1");
        let mut query = sqlx::query(&sql);
        for pointer in &pointers {
            query = query.bind(pointer);
        }
        query
            .fetch_optional(&mut **tx)
            .await?
            .map(|row| row.get::<i64, _>("state_id"))
    };

    let guids = serde_json::to_string(&state.guids)?;
    let parent = serde_json::to_string(&state.parent_guids)?;
    let metadata = serde_json::to_string(&state.metadata)?;
    let extra = serde_json::to_string(&state.extra)?;

    let (id, created) = match existing_id {
        Some(id) => {
            sqlx::query(
                "UPDATE state SET kind = ?, via = ?, title = ?, year = ?, season = ?, \
                 episode = ?, watched = ?, updated = ?, progress = ?, guids = ?, parent = ?, \
                 metadata = ?, extra = ? WHERE id = ?",
            )
            .bind(state.kind.as_str())
            .bind(&state.via)
            .bind(&state.title)
            .bind(state.year)
            .bind(state.season)
            .bind(state.episode)
            .bind(state.watched as i64)
            .bind(state.updated)
            .bind(state.progress.map(|p| p as i64))
            .bind(&guids)
            .bind(&parent)
            .bind(&metadata)
            .bind(&extra)
            .bind(id)
            .execute(&mut **tx)
            .await?;
            (id, false)
        }
        None => {
            let result = sqlx::query(
                "INSERT INTO state (kind, via, title, year, season, episode, watched, \
                 updated, progress, guids, parent, metadata, extra) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(state.kind.as_str())
            .bind(&state.via)
            .bind(&state.title)
            .bind(state.year)
            .bind(state.season)
            .bind(state.episode)
            .bind(state.watched as i64)
            .bind(state.updated)
            .bind(state.progress.map(|p| p as i64))
            .bind(&guids)
            .bind(&parent)
            .bind(&metadata)
            .bind(&extra)
            .execute(&mut **tx)
            .await?;
            (result.last_insert_rowid(), true)
        }
    };

    // Refresh the pointer index for this row.
    sqlx::query("DELETE FROM pointer WHERE state_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    for pointer in &pointers {
        sqlx::query("INSERT OR REPLACE INTO pointer (pointer, state_id) VALUES (?, ?)")
            .bind(pointer)
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(UpsertOutcome { id, created })
}

fn row_to_state(row: &SqliteRow) -> Result<State> {
    let kind_raw: String = row.get("kind");
    let kind = MediaKind::parse(&kind_raw)
        .with_context(|| format!("unknown media kind '{kind_raw}' in store"))?;

    let mut state = State::new(kind, row.get::<String, _>("via"), row.get::<String, _>("title"));
    state.id = row.get("id");
    state.year = row.get("year");
    state.season = row.get("season");
    state.episode = row.get("episode");
    state.watched = row.get::<i64, _>("watched") != 0;
    state.updated = row.get("updated");
    state.progress = row.get::<Option<i64>, _>("progress").map(|p| p as u64);

    state.guids = parse_json_column(row, "guids");
    state.parent_guids = parse_json_column(row, "parent");
    state.metadata = parse_json_column(row, "metadata");
    state.extra = parse_json_column(row, "extra");

    Ok(state)
}

fn parse_json_column<T: serde::de::DeserializeOwned + Default>(row: &SqliteRow, column: &str) -> T {
    let raw: String = row.get(column);
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(column, error = %e, "corrupt JSON column, using empty value");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchstate_models::guid::GuidSource;
    use watchstate_models::BackendMetadata;

    fn sample(via: &str, imdb: &str, updated: i64) -> State {
        let mut state = State::new(MediaKind::Movie, via, "Dune");
        state.year = Some(2021);
        state.guids.insert(GuidSource::Imdb, imdb);
        state.watched = true;
        state.updated = updated;
        state.metadata.insert(
            via.to_string(),
            BackendMetadata { id: "42".to_string(), watched: true, ..Default::default() },
        );
        state
    }

    #[tokio::test]
    async fn upsert_then_find_by_pointer() {
        let store = StateStore::open_in_memory().await.unwrap();
        let state = sample("home_jellyfin", "tt1160419", 100);

        let outcome = store.upsert(&state).await.unwrap();
        assert!(outcome.created);

        let found = store
            .find_by_pointers(&["imdb://tt1160419".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Dune");
        assert_eq!(found[0].id, outcome.id);

        // The virtual pointer resolves too.
        let found = store
            .find_by_pointers(&["backend://home_jellyfin:42".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn second_upsert_with_shared_pointer_updates_in_place() {
        let store = StateStore::open_in_memory().await.unwrap();
        let first = sample("home_jellyfin", "tt1160419", 100);
        let outcome = store.upsert(&first).await.unwrap();

        let mut second = sample("home_plex", "tt1160419", 200);
        second.metadata.insert(
            "home_jellyfin".to_string(),
            BackendMetadata { id: "42".to_string(), watched: true, ..Default::default() },
        );
        let outcome2 = store.upsert(&second).await.unwrap();
        assert!(!outcome2.created);
        assert_eq!(outcome.id, outcome2.id);
        assert_eq!(store.count().await.unwrap(), 1);

        let stored = store.get(outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.via, "home_plex");
        assert_eq!(stored.metadata.len(), 2);
    }

    #[tokio::test]
    async fn since_filters_on_updated() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.upsert(&sample("a", "tt0000001", 100)).await.unwrap();
        store.upsert(&sample("a", "tt0000002", 200)).await.unwrap();
        store.upsert(&sample("a", "tt0000003", 300)).await.unwrap();

        let newer = store.since(150).await.unwrap();
        assert_eq!(newer.len(), 2);
        assert!(newer.iter().all(|s| s.updated > 150));
    }

    #[tokio::test]
    async fn page_filters_and_counts() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.upsert(&sample("home_plex", "tt0000001", 100)).await.unwrap();
        store.upsert(&sample("home_jellyfin", "tt0000002", 200)).await.unwrap();

        let filter = PageFilter { via: Some("home_plex".to_string()), ..Default::default() };
        let (states, total) = store.page(&filter, PageSort::default(), 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(states[0].via, "home_plex");

        let filter = PageFilter { backend: Some("home_jellyfin".to_string()), ..Default::default() };
        let (_, total) = store.page(&filter, PageSort::default(), 10, 0).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn parity_lists_and_prunes_stragglers() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.upsert(&sample("home_plex", "tt0000001", 100)).await.unwrap();

        let mut multi = sample("home_plex", "tt0000002", 100);
        multi.metadata.insert(
            "home_jellyfin".to_string(),
            BackendMetadata { id: "7".to_string(), ..Default::default() },
        );
        store.upsert(&multi).await.unwrap();

        let stragglers = store.parity(2).await.unwrap();
        assert_eq!(stragglers.len(), 1);
        assert_eq!(stragglers[0].guids.get(GuidSource::Imdb), Some("tt0000001"));

        let pruned = store.prune_parity(2).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_pointers_too() {
        let store = StateStore::open_in_memory().await.unwrap();
        let outcome = store.upsert(&sample("a", "tt0000001", 100)).await.unwrap();
        assert!(store.delete(outcome.id).await.unwrap());
        let found = store
            .find_by_pointers(&["imdb://tt0000001".to_string()])
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
