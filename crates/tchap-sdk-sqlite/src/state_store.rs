// Copyright 2022 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, path::Path};

use async_trait::async_trait;
use deadpool_sqlite::{Object as SqliteAsyncConn, Pool as SqlitePool, Runtime};
use ruma::{EventId, RoomId, TransactionId};
use rusqlite::{OptionalExtension, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use tchap_sdk_base::{
    deserialized_responses::{Direction, SyncTimelineEvent, TimelineChunk},
    store::{
        send_queue::{LocalEcho, SendState},
        RoomBatch, StoreError, TimelineSlice,
    },
    RoomInfo, StateStore, StateStoreDataKey, StateStoreDataValue,
};
use tokio::fs;
use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    utils::{load_db_version, SqliteAsyncConnExt, SqliteKeyValueStoreConnExt},
    OpenStoreError,
};

/// Identifier of the latest database version.
///
/// This is used to figure whether the sqlite database requires a migration.
/// Every new SQL migration should imply a bump of this number.
const DATABASE_VERSION: u8 = 1;

/// A sqlite based state store.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    /// Open the sqlite-based state store in the given directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OpenStoreError> {
        let pool = create_pool(path.as_ref()).await?;

        Self::open_with_pool(pool).await
    }

    /// Create a sqlite-based state store using the given sqlite database pool.
    pub async fn open_with_pool(pool: SqlitePool) -> Result<Self, OpenStoreError> {
        let conn = pool.get().await?;
        let version = load_db_version(&conn).await?;

        if version == 0 {
            init(&conn).await?;
        } else if version > DATABASE_VERSION {
            return Err(StoreError::UnsupportedDatabaseVersion(
                version.into(),
                DATABASE_VERSION.into(),
            )
            .into());
        }

        Ok(Self { pool })
    }

    async fn acquire(&self) -> Result<SqliteAsyncConn> {
        Ok(self.pool.get().await?)
    }
}

async fn create_pool(path: &Path) -> Result<SqlitePool, OpenStoreError> {
    fs::create_dir_all(path).await.map_err(OpenStoreError::CreateDir)?;
    let cfg = deadpool_sqlite::Config::new(path.join("tchap-sdk-state.sqlite3"));
    Ok(cfg.create_pool(Runtime::Tokio1)?)
}

/// Initialize the database.
async fn init(conn: &SqliteAsyncConn) -> Result<()> {
    // First turn on WAL mode, this can't be done in the transaction, it fails with
    // the error message: "cannot change into wal mode from within a transaction".
    conn.execute_batch("PRAGMA journal_mode = wal;").await?;
    conn.with_transaction(|txn| {
        txn.execute_batch(include_str!("../migrations/state_store/001_init.sql"))?;
        txn.set_db_version(DATABASE_VERSION)?;

        Ok(())
    })
    .await
}

fn serialize_json(value: &impl Serialize) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn deserialize_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// The synchronous queries on a room, run on the connection's thread inside a
/// transaction.
trait SqliteTransactionStateStoreExt {
    fn set_room_info(&self, info: &RoomInfo) -> Result<()>;

    fn get_chunk_tokens(&self, room_id: &str) -> Result<(Option<String>, Option<String>)>;

    fn set_chunk_tokens(
        &self,
        room_id: &str,
        prev_token: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<()>;

    fn has_event(&self, room_id: &str, event_id: &str) -> Result<bool>;

    fn has_events(&self, room_id: &str) -> Result<bool>;

    fn insert_event(&self, room_id: &str, position: i64, event: &SyncTimelineEvent) -> Result<()>;

    fn remove_timeline(&self, room_id: &str) -> Result<()>;

    fn load_echoes(&self, room_id: &str) -> Result<Vec<LocalEcho>>;

    fn remove_echo(&self, room_id: &str, transaction_id: &str) -> Result<bool>;
}

impl SqliteTransactionStateStoreExt for Transaction<'_> {
    fn set_room_info(&self, info: &RoomInfo) -> Result<()> {
        let state = serde_json::to_string(&info.room_state)?;
        let data = serialize_json(info)?;
        self.prepare_cached(
            "INSERT OR REPLACE INTO room_info (room_id, state, data) VALUES (?, ?, ?)",
        )?
        .execute((info.room_id.as_str(), state, data))?;
        Ok(())
    }

    fn get_chunk_tokens(&self, room_id: &str) -> Result<(Option<String>, Option<String>)> {
        Ok(self
            .prepare_cached("SELECT prev_token, next_token FROM timeline_chunk WHERE room_id = ?")?
            .query_row((room_id,), |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?
            .unwrap_or_default())
    }

    fn set_chunk_tokens(
        &self,
        room_id: &str,
        prev_token: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<()> {
        self.prepare_cached(
            "INSERT OR REPLACE INTO timeline_chunk (room_id, prev_token, next_token)
             VALUES (?, ?, ?)",
        )?
        .execute((room_id, prev_token, next_token))?;
        Ok(())
    }

    fn has_event(&self, room_id: &str, event_id: &str) -> Result<bool> {
        Ok(self
            .prepare_cached("SELECT 1 FROM timeline_event WHERE room_id = ? AND event_id = ?")?
            .exists((room_id, event_id))?)
    }

    fn has_events(&self, room_id: &str) -> Result<bool> {
        Ok(self.prepare_cached("SELECT 1 FROM timeline_event WHERE room_id = ?")?.exists((room_id,))?)
    }

    fn insert_event(&self, room_id: &str, position: i64, event: &SyncTimelineEvent) -> Result<()> {
        let data = serialize_json(event)?;
        self.prepare_cached(
            "INSERT INTO timeline_event (room_id, position, event_id, data) VALUES (?, ?, ?, ?)",
        )?
        .execute((room_id, position, event.event_id.as_str(), data))?;
        Ok(())
    }

    fn remove_timeline(&self, room_id: &str) -> Result<()> {
        self.prepare_cached("DELETE FROM timeline_event WHERE room_id = ?")?.execute((room_id,))?;
        self.prepare_cached("DELETE FROM timeline_chunk WHERE room_id = ?")?.execute((room_id,))?;
        Ok(())
    }

    fn load_echoes(&self, room_id: &str) -> Result<Vec<LocalEcho>> {
        self.prepare_cached("SELECT data FROM local_echo WHERE room_id = ? ORDER BY position")?
            .query_map((room_id,), |row| row.get::<_, Vec<u8>>(0))?
            .map(|data| deserialize_json(&data?))
            .collect()
    }

    fn remove_echo(&self, room_id: &str, transaction_id: &str) -> Result<bool> {
        let removed = self
            .prepare_cached("DELETE FROM local_echo WHERE room_id = ? AND transaction_id = ?")?
            .execute((room_id, transaction_id))?;
        Ok(removed > 0)
    }
}

/// Apply a [`RoomBatch`] inside a transaction.
fn apply_room_batch(txn: &Transaction<'_>, batch: &RoomBatch) -> Result<()> {
    let room_id = batch.room_id().as_str();
    let mut info = batch.room_info.clone();

    for event in &batch.state_events {
        let Some(state_key) = &event.state_key else { continue };

        let inserted = txn
            .prepare_cached(
                "INSERT OR IGNORE INTO applied_state_event (room_id, event_id) VALUES (?, ?)",
            )?
            .execute((room_id, event.event_id.as_str()))?;

        if inserted == 0 {
            trace!(event_id = %event.event_id, "State event already applied, skipping");
            continue;
        }

        info.handle_state_event(event);

        let data = serialize_json(event)?;
        txn.prepare_cached(
            "INSERT OR REPLACE INTO state_event (room_id, event_type, state_key, event_id, data)
             VALUES (?, ?, ?, ?, ?)",
        )?
        .execute((room_id, &event.event_type, state_key, event.event_id.as_str(), data))?;
    }

    if batch.clear_timeline {
        txn.remove_timeline(room_id)?;
        txn.prepare_cached("DELETE FROM local_echo WHERE room_id = ?")?.execute((room_id,))?;
    } else {
        let (mut prev_token, mut next_token) = txn.get_chunk_tokens(room_id)?;

        if batch.limited {
            txn.remove_timeline(room_id)?;
            prev_token = batch.timeline.prev_token.clone();
        } else if prev_token.is_none() && !txn.has_events(room_id)? {
            prev_token = batch.timeline.prev_token.clone();
        }

        if !batch.timeline.events.is_empty() {
            let mut echoes = txn.load_echoes(room_id)?;
            let mut position: i64 = txn
                .prepare_cached("SELECT max(position) FROM timeline_event WHERE room_id = ?")?
                .query_row((room_id,), |row| row.get::<_, Option<i64>>(0))?
                .map_or(0, |max| max + 1);

            for event in &batch.timeline.events {
                let mut event = event.clone();

                let echo_position = echoes.iter().position(|echo| {
                    event.transaction_id() == Some(&*echo.transaction_id)
                        || echo.event_id().as_deref() == Some(&*event.event_id)
                });

                if let Some(index) = echo_position {
                    let echo = echoes.remove(index);
                    txn.remove_echo(room_id, echo.transaction_id.as_str())?;
                    debug!(
                        event_id = %event.event_id,
                        transaction_id = %echo.transaction_id,
                        "Reconciled local echo"
                    );
                    event.unsigned.transaction_id.get_or_insert(echo.transaction_id);
                }

                if txn.has_event(room_id, event.event_id.as_str())? {
                    trace!(event_id = %event.event_id, "Event already stored, skipping");
                    continue;
                }

                txn.insert_event(room_id, position, &event)?;
                position += 1;
            }
        }

        if let Some(token) = &batch.timeline.next_token {
            next_token = Some(token.clone());
        }

        txn.set_chunk_tokens(room_id, prev_token.as_deref(), next_token.as_deref())?;
    }

    txn.set_room_info(&info)?;

    Ok(())
}

/// Read a [`TimelineSlice`] inside a read transaction.
fn query_timeline_slice(
    txn: &Transaction<'_>,
    room_id: &str,
    from: Option<&str>,
    direction: Direction,
    limit: usize,
) -> Result<Option<TimelineSlice>> {
    let anchor = match from {
        Some(event_id) => {
            let position = txn
                .prepare_cached(
                    "SELECT position FROM timeline_event WHERE room_id = ? AND event_id = ?",
                )?
                .query_row((room_id, event_id), |row| row.get::<_, i64>(0))
                .optional()?;

            match position {
                Some(position) => Some(position),
                None => return Ok(None),
            }
        }
        None => None,
    };

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let has_event_where = |condition: &str, position: i64| -> Result<bool> {
        Ok(txn
            .prepare(&format!(
                "SELECT 1 FROM timeline_event WHERE room_id = ? AND position {condition} ?"
            ))?
            .exists((room_id, position))?)
    };

    let (rows, is_cache_start, is_live_end) = match direction {
        Direction::Backward => {
            let upper = anchor.unwrap_or(i64::MAX);
            let mut rows = txn
                .prepare_cached(
                    "SELECT position, data FROM timeline_event
                     WHERE room_id = ? AND position < ?
                     ORDER BY position DESC LIMIT ?",
                )?
                .query_map((room_id, upper, limit), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.reverse();

            let lower = rows.first().map_or(upper, |(position, _)| *position);
            let is_cache_start = !has_event_where("<", lower)?;
            // The anchor itself is after the slice.
            let is_live_end = anchor.is_none();

            (rows, is_cache_start, is_live_end)
        }
        Direction::Forward => {
            let lower = anchor.unwrap_or(i64::MIN);
            let rows = txn
                .prepare_cached(
                    "SELECT position, data FROM timeline_event
                     WHERE room_id = ? AND position > ?
                     ORDER BY position ASC LIMIT ?",
                )?
                .query_map((room_id, lower, limit), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let upper = rows.last().map_or(lower, |(position, _)| *position);
            let is_cache_start = anchor.is_none();
            let is_live_end = !has_event_where(">", upper)?;

            (rows, is_cache_start, is_live_end)
        }
    };

    let events = rows
        .into_iter()
        .map(|(_, data)| deserialize_json(&data))
        .collect::<Result<Vec<SyncTimelineEvent>>>()?;

    let (prev_token, next_token) = txn.get_chunk_tokens(room_id)?;
    let local_echoes = if is_live_end { txn.load_echoes(room_id)? } else { Vec::new() };

    Ok(Some(TimelineSlice {
        chunk: TimelineChunk {
            prev_token: if is_cache_start { prev_token } else { None },
            next_token: if is_live_end { next_token } else { None },
            events,
        },
        is_cache_start,
        is_live_end,
        local_echoes,
    }))
}

/// Prepend a backward pagination chunk inside a transaction.
fn prepend_backward_chunk(
    txn: &Transaction<'_>,
    room_id: &str,
    from_token: &str,
    chunk: &TimelineChunk,
) -> Result<Vec<SyncTimelineEvent>> {
    let (prev_token, next_token) = txn.get_chunk_tokens(room_id)?;

    if prev_token.as_deref() != Some(from_token) {
        return Err(StoreError::PaginationTokenMismatch {
            expected: prev_token,
            got: from_token.to_owned(),
        }
        .into());
    }

    let mut position: i64 = txn
        .prepare_cached("SELECT min(position) FROM timeline_event WHERE room_id = ?")?
        .query_row((room_id,), |row| row.get::<_, Option<i64>>(0))?
        .map_or(0, |min| min - 1);

    let mut new_events = Vec::with_capacity(chunk.events.len());
    for event in &chunk.events {
        if !txn.has_event(room_id, event.event_id.as_str())?
            && !new_events.iter().any(|e: &SyncTimelineEvent| e.event_id == event.event_id)
        {
            new_events.push(event.clone());
        }
    }

    // The chunk is in chronological order, insert the newest first so the
    // positions keep decreasing.
    for event in new_events.iter().rev() {
        txn.insert_event(room_id, position, event)?;
        position -= 1;
    }

    txn.set_chunk_tokens(room_id, chunk.prev_token.as_deref(), next_token.as_deref())?;

    Ok(new_events)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    type Error = Error;

    async fn get_kv_data(&self, key: StateStoreDataKey) -> Result<Option<StateStoreDataValue>> {
        let data = self
            .acquire()
            .await?
            .query_row("SELECT value FROM kv WHERE key = ?", (key.as_str(),), |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .await?;

        data.map(|data| {
            Ok(match key {
                StateStoreDataKey::SyncToken => {
                    StateStoreDataValue::SyncToken(rmp_serde::from_slice(&data)?)
                }
                StateStoreDataKey::Session => {
                    StateStoreDataValue::Session(rmp_serde::from_slice(&data)?)
                }
            })
        })
        .transpose()
    }

    async fn set_kv_data(&self, key: StateStoreDataKey, value: StateStoreDataValue) -> Result<()> {
        let serialized = match value {
            StateStoreDataValue::SyncToken(token) => rmp_serde::to_vec_named(&token)?,
            StateStoreDataValue::Session(session) => rmp_serde::to_vec_named(&session)?,
        };

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                txn.set_kv(key.as_str(), &serialized)?;
                Ok(())
            })
            .await
    }

    async fn remove_kv_data(&self, key: StateStoreDataKey) -> Result<()> {
        self.acquire().await?.execute("DELETE FROM kv WHERE key = ?", (key.as_str(),)).await?;
        Ok(())
    }

    async fn apply_room_batch(&self, batch: &RoomBatch) -> Result<()> {
        let batch = batch.clone();
        self.acquire().await?.with_transaction(move |txn| apply_room_batch(txn, &batch)).await
    }

    async fn get_room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>> {
        self.acquire()
            .await?
            .query_row("SELECT data FROM room_info WHERE room_id = ?", (room_id.to_string(),), |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .await?
            .map(|data| deserialize_json(&data))
            .transpose()
    }

    async fn get_room_infos(&self) -> Result<Vec<RoomInfo>> {
        self.acquire()
            .await?
            .with_read_transaction(|txn| {
                txn.prepare("SELECT data FROM room_info")?
                    .query_map((), |row| row.get::<_, Vec<u8>>(0))?
                    .map(|data| deserialize_json(&data?))
                    .collect()
            })
            .await
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<SyncTimelineEvent>> {
        self.acquire()
            .await?
            .query_row(
                "SELECT data FROM state_event
                 WHERE room_id = ? AND event_type = ? AND state_key = ?",
                (room_id.to_string(), event_type.to_owned(), state_key.to_owned()),
                |row| row.get::<_, Vec<u8>>(0),
            )
            .await?
            .map(|data| deserialize_json(&data))
            .transpose()
    }

    async fn query_timeline_slice(
        &self,
        room_id: &RoomId,
        from: Option<&EventId>,
        direction: Direction,
        limit: usize,
    ) -> Result<Option<TimelineSlice>> {
        let room_id = room_id.to_string();
        let from = from.map(ToString::to_string);

        self.acquire()
            .await?
            .with_read_transaction(move |txn| {
                query_timeline_slice(txn, &room_id, from.as_deref(), direction, limit)
            })
            .await
    }

    async fn prepend_backward_chunk(
        &self,
        room_id: &RoomId,
        from_token: &str,
        chunk: &TimelineChunk,
    ) -> Result<Vec<SyncTimelineEvent>> {
        let room_id = room_id.to_string();
        let from_token = from_token.to_owned();
        let chunk = chunk.clone();

        self.acquire()
            .await?
            .with_transaction(move |txn| prepend_backward_chunk(txn, &room_id, &from_token, &chunk))
            .await
    }

    async fn upsert_local_echo(&self, room_id: &RoomId, echo: &LocalEcho) -> Result<()> {
        let room_id = room_id.to_string();
        let transaction_id = echo.transaction_id.to_string();
        let data = serialize_json(echo)?;

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                let updated = txn
                    .prepare_cached(
                        "UPDATE local_echo SET data = ? WHERE room_id = ? AND transaction_id = ?",
                    )?
                    .execute((&data, &room_id, &transaction_id))?;

                if updated == 0 {
                    txn.prepare_cached(
                        "INSERT INTO local_echo (room_id, transaction_id, position, data)
                         VALUES (?1, ?2, (SELECT coalesce(max(position), -1) + 1
                                          FROM local_echo WHERE room_id = ?1), ?3)",
                    )?
                    .execute((&room_id, &transaction_id, &data))?;
                }

                Ok(())
            })
            .await
    }

    async fn update_echo_send_state(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
        send_state: &SendState,
    ) -> Result<bool> {
        let room_id = room_id.to_string();
        let transaction_id = transaction_id.to_string();
        let send_state = send_state.clone();

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                let data = txn
                    .prepare_cached(
                        "SELECT data FROM local_echo WHERE room_id = ? AND transaction_id = ?",
                    )?
                    .query_row((&room_id, &transaction_id), |row| row.get::<_, Vec<u8>>(0))
                    .optional()?;

                let Some(data) = data else {
                    return Ok(false);
                };

                let mut echo: LocalEcho = deserialize_json(&data)?;
                echo.send_state = send_state;

                txn.prepare_cached(
                    "UPDATE local_echo SET data = ? WHERE room_id = ? AND transaction_id = ?",
                )?
                .execute((serialize_json(&echo)?, &room_id, &transaction_id))?;

                Ok(true)
            })
            .await
    }

    async fn remove_local_echo(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
    ) -> Result<bool> {
        let room_id = room_id.to_string();
        let transaction_id = transaction_id.to_string();

        self.acquire()
            .await?
            .with_transaction(move |txn| txn.remove_echo(&room_id, &transaction_id))
            .await
    }

    async fn local_echoes(&self, room_id: &RoomId) -> Result<Vec<LocalEcho>> {
        let room_id = room_id.to_string();
        self.acquire().await?.with_read_transaction(move |txn| txn.load_echoes(&room_id)).await
    }

    async fn remove_room(&self, room_id: &RoomId) -> Result<()> {
        let room_id = room_id.to_string();

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                for table in [
                    "room_info",
                    "state_event",
                    "applied_state_event",
                    "timeline_chunk",
                    "timeline_event",
                    "local_echo",
                ] {
                    txn.execute(&format!("DELETE FROM {table} WHERE room_id = ?"), (&room_id,))?;
                }

                debug!(%room_id, "Removed room");
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

    use once_cell::sync::Lazy;
    use ruma::room_id;
    use serde_json::json;
    use tchap_sdk_base::{
        deserialized_responses::Direction,
        statestore_integration_tests,
        store::{send_queue::LocalEcho, IntoStateStore, RoomBatch},
        RoomInfo, RoomState, StateStore, StateStoreDataKey, StateStoreDataValue,
    };
    use tempfile::{tempdir, TempDir};

    use super::SqliteStateStore;
    use crate::OpenStoreError;

    static TMP_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().unwrap());
    static NUM: AtomicU32 = AtomicU32::new(0);

    async fn get_store() -> Result<impl StateStore, OpenStoreError> {
        let name = NUM.fetch_add(1, SeqCst).to_string();
        let tmpdir_path = TMP_DIR.path().join(name);

        SqliteStateStore::open(tmpdir_path.to_str().unwrap()).await
    }

    statestore_integration_tests!();

    #[tokio::test]
    async fn test_everything_survives_a_reopen() {
        let dir = tempdir().unwrap();
        let room_id = room_id!("!r:example.org");

        {
            let store = SqliteStateStore::open(dir.path()).await.unwrap().into_state_store();
            store
                .set_kv_data(
                    StateStoreDataKey::SyncToken,
                    StateStoreDataValue::SyncToken("t1".to_owned()),
                )
                .await
                .unwrap();

            let mut batch = RoomBatch::new(RoomInfo::new(room_id, RoomState::Joined));
            batch.timeline.prev_token = Some("p0".to_owned());
            batch.timeline.events.push(
                serde_json::from_value(json!({
                    "event_id": "$e1",
                    "sender": "@alice:example.org",
                    "type": "m.room.message",
                    "content": { "body": "hi" },
                    "origin_server_ts": 1,
                }))
                .unwrap(),
            );
            store.apply_room_batch(&batch).await.unwrap();

            let echo = LocalEcho::new(
                "tx1".into(),
                "m.room.message".to_owned(),
                json!({ "msgtype": "m.text", "body": "pending" }),
            );
            store.upsert_local_echo(room_id, &echo).await.unwrap();
        }

        let store = SqliteStateStore::open(dir.path()).await.unwrap();

        let token = store.get_kv_data(StateStoreDataKey::SyncToken).await.unwrap();
        assert_eq!(token.and_then(StateStoreDataValue::into_sync_token).as_deref(), Some("t1"));

        let slice = store
            .query_timeline_slice(room_id, None, Direction::Backward, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slice.chunk.events.len(), 1);
        assert_eq!(slice.chunk.prev_token.as_deref(), Some("p0"));
        assert_eq!(slice.local_echoes.len(), 1);
        assert_eq!(slice.local_echoes[0].transaction_id, "tx1");
    }
}
