use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::{Mutex, broadcast};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeItemSnafu, EncodeItemSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteQuerySnafu, SqliteSchemaSnafu, StorageResult,
};
use super::ids::QueueId;
use super::{BoxFuture, DEFAULT_LIVE_CAPACITY, DurableQueue};

const CREATE_QUEUE_ITEMS_TABLE: &str = "CREATE TABLE IF NOT EXISTS queue_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    appended_at INTEGER NOT NULL
)";

const CREATE_QUEUE_ITEMS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS queue_items_by_queue ON queue_items (queue_id, seq)";

/// Connection pool shared by every queue stored in one sqlite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One connection serializes writers and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query(CREATE_QUEUE_ITEMS_TABLE)
            .execute(&pool)
            .await
            .context(SqliteSchemaSnafu {
                stage: "sqlite-open-create-table",
            })?;
        sqlx::query(CREATE_QUEUE_ITEMS_INDEX)
            .execute(&pool)
            .await
            .context(SqliteSchemaSnafu {
                stage: "sqlite-open-create-index",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite queue store");
        Ok(Self { pool, database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens (or creates) the queue with the given id.
    pub fn queue<T>(&self, id: QueueId) -> SqliteQueue<T>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        SqliteQueue::new(self.pool.clone(), id)
    }
}

#[derive(Debug, FromRow)]
struct QueueItemRow {
    seq: i64,
    payload: String,
}

/// Queue persisted as JSON rows in sqlite.
///
/// The live feed is local to this value: appends made through another
/// `SqliteQueue` for the same id are visible to `read_all` but not broadcast.
pub struct SqliteQueue<T> {
    id: QueueId,
    pool: SqlitePool,
    append_lock: Mutex<()>,
    live: broadcast::Sender<T>,
    _items: PhantomData<fn() -> T>,
}

impl<T> SqliteQueue<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn new(pool: SqlitePool, id: QueueId) -> Self {
        let (live, _) = broadcast::channel(DEFAULT_LIVE_CAPACITY);
        Self {
            id,
            pool,
            append_lock: Mutex::new(()),
            live,
            _items: PhantomData,
        }
    }

    async fn append_batch(&self, items: Vec<T>) -> StorageResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let payloads = items
            .iter()
            .map(|item| {
                serde_json::to_string(item).context(EncodeItemSnafu {
                    stage: "sqlite-queue-encode-item",
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let _guard = self.append_lock.lock().await;
        let appended_at = unix_timestamp_millis();
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "sqlite-queue-append-begin",
        })?;

        for payload in payloads {
            sqlx::query("INSERT INTO queue_items (queue_id, payload, appended_at) VALUES (?, ?, ?)")
                .bind(self.id.to_string())
                .bind(payload)
                .bind(appended_at)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-queue-append-insert",
                })?;
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "sqlite-queue-append-commit",
        })?;

        for item in items {
            let _ = self.live.send(item);
        }
        Ok(())
    }

    async fn read_items(&self) -> StorageResult<Vec<T>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(
            "SELECT seq, payload FROM queue_items WHERE queue_id = ? ORDER BY seq",
        )
        .bind(self.id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-queue-read-all",
        })?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_str(&row.payload).context(DecodeItemSnafu {
                    stage: "sqlite-queue-decode-item",
                    seq: row.seq,
                })
            })
            .collect()
    }
}

impl<T> DurableQueue<T> for SqliteQueue<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn id(&self) -> QueueId {
        self.id
    }

    fn append<'a>(&'a self, items: Vec<T>) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.append_batch(items))
    }

    fn subscribe(&self) -> broadcast::Receiver<T> {
        self.live.subscribe()
    }

    fn read_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<T>>> {
        Box::pin(self.read_items())
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        seq: u32,
        text: String,
    }

    fn entry(seq: u32, text: &str) -> Entry {
        Entry {
            seq,
            text: text.to_string(),
        }
    }

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://a.db"), "sqlite://a.db");
        assert_eq!(normalize_database_url("data/a.db"), "sqlite://data/a.db");
    }

    #[tokio::test]
    async fn appended_batches_round_trip_per_queue() {
        let store = SqliteStore::open(":memory:").await.expect("open store");
        let left = store.queue::<Entry>(QueueId::new_v7());
        let right = store.queue::<Entry>(QueueId::new_v7());

        left.append(vec![entry(1, "one"), entry(2, "two")])
            .await
            .expect("append left");
        right.append(vec![entry(9, "other")]).await.expect("append right");
        left.append(vec![entry(3, "three")]).await.expect("append left");

        let items = left.read_all().await.expect("read left");
        assert_eq!(items, vec![entry(1, "one"), entry(2, "two"), entry(3, "three")]);
        assert_eq!(right.read_all().await.expect("read right"), vec![entry(9, "other")]);
    }

    #[tokio::test]
    async fn reopening_a_queue_id_sees_existing_rows() {
        let store = SqliteStore::open(":memory:").await.expect("open store");
        let id = QueueId::new_v7();
        store
            .queue::<Entry>(id)
            .append(vec![entry(1, "kept")])
            .await
            .expect("append");

        let reopened = store.queue::<Entry>(id);
        let mut live = reopened.subscribe();
        reopened.append(vec![entry(2, "new")]).await.expect("append");

        assert_eq!(
            reopened.read_all().await.expect("read"),
            vec![entry(1, "kept"), entry(2, "new")]
        );
        assert_eq!(live.recv().await.expect("live item"), entry(2, "new"));
    }
}
