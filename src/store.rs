use anyhow::{Context as AnyhowContext, Result};
use serenity::async_trait;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection as SqliteConnection;
use tracing::{error, info};

use crate::trigger::TriggerRecord;

/// Durable storage for triggers and guild options.
///
/// Only read at startup. Everything after that is written through a
/// [`StoreWriter`] and never waited on by message handling.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn guild_ids(&self) -> Result<Vec<GuildId>>;
    /// Records in the order they were first saved.
    async fn load_triggers(&self, guild_id: GuildId) -> Result<Vec<TriggerRecord>>;
    async fn load_guild_options(&self, guild_id: GuildId) -> Result<Vec<(String, String)>>;
    async fn save_trigger(&self, guild_id: GuildId, record: &TriggerRecord) -> Result<()>;
    async fn delete_trigger(&self, guild_id: GuildId, name: &str) -> Result<()>;
    async fn set_guild_option(&self, guild_id: GuildId, key: &str, value: &str) -> Result<()>;
}

pub struct SqliteStore {
    conn: SqliteConnection,
}

impl SqliteStore {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = SqliteConnection::open(path)
            .await
            .with_context(|| format!("Failed to open trigger database {}", path))?;
        let store = Self { conn };
        store.initialize().await?;
        info!("Opened trigger database at {}", path);
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = SqliteConnection::open_in_memory().await?;
        let store = Self { conn };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS triggers (
                        guild_id TEXT NOT NULL,
                        name TEXT NOT NULL,
                        record TEXT NOT NULL,
                        PRIMARY KEY (guild_id, name)
                    );
                    CREATE TABLE IF NOT EXISTS guild_options (
                        guild_id TEXT NOT NULL,
                        key TEXT NOT NULL,
                        value TEXT NOT NULL,
                        PRIMARY KEY (guild_id, key)
                    );",
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .context("Failed to create trigger tables")?;
        Ok(())
    }
}

fn parse_guild_id(raw: &str) -> Option<GuildId> {
    raw.parse::<u64>().ok().filter(|id| *id != 0).map(GuildId::new)
}

#[async_trait]
impl TriggerStore for SqliteStore {
    async fn guild_ids(&self) -> Result<Vec<GuildId>> {
        let raw = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT guild_id FROM triggers UNION SELECT guild_id FROM guild_options",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                Ok::<_, rusqlite::Error>(ids)
            })
            .await?;
        Ok(raw.iter().filter_map(|id| parse_guild_id(id)).collect())
    }

    async fn load_triggers(&self, guild_id: GuildId) -> Result<Vec<TriggerRecord>> {
        let guild = guild_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, record FROM triggers WHERE guild_id = ? ORDER BY rowid",
                )?;
                let rows = stmt.query_map([&guild], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                Ok::<_, rusqlite::Error>(result)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (name, json) in rows {
            match serde_json::from_str::<TriggerRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => error!("Skipping unreadable trigger {} in guild {}: {}", name, guild_id, e),
            }
        }
        Ok(records)
    }

    async fn load_guild_options(&self, guild_id: GuildId) -> Result<Vec<(String, String)>> {
        let guild = guild_id.to_string();
        let options = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM guild_options WHERE guild_id = ?")?;
                let rows = stmt.query_map([&guild], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                Ok::<_, rusqlite::Error>(result)
            })
            .await?;
        Ok(options)
    }

    async fn save_trigger(&self, guild_id: GuildId, record: &TriggerRecord) -> Result<()> {
        let guild = guild_id.to_string();
        let name = record.name.clone();
        let json = serde_json::to_string(record)?;
        // upsert rather than replace so the rowid, and with it the load order, survives
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO triggers (guild_id, name, record) VALUES (?1, ?2, ?3)
                     ON CONFLICT(guild_id, name) DO UPDATE SET record = excluded.record",
                    [&guild, &name, &json],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn delete_trigger(&self, guild_id: GuildId, name: &str) -> Result<()> {
        let guild = guild_id.to_string();
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM triggers WHERE guild_id = ?1 AND name = ?2",
                    [&guild, &name],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn set_guild_option(&self, guild_id: GuildId, key: &str, value: &str) -> Result<()> {
        let guild = guild_id.to_string();
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO guild_options (guild_id, key, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(guild_id, key) DO UPDATE SET value = excluded.value",
                    [&guild, &key, &value],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }
}

enum StoreOp {
    Save(GuildId, TriggerRecord),
    Delete(GuildId, String),
    SetOption(GuildId, String, String),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle for storage writes.
///
/// Operations are applied one at a time in the order they were queued, so two
/// edits to the same guild can never land out of order.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreOp>,
}

impl StoreWriter {
    pub fn spawn(store: Arc<dyn TriggerStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreOp>();
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    StoreOp::Save(guild_id, record) => {
                        if let Err(e) = store.save_trigger(guild_id, &record).await {
                            error!("Failed to save trigger {} in guild {}: {:?}", record.name, guild_id, e);
                        }
                    }
                    StoreOp::Delete(guild_id, name) => {
                        if let Err(e) = store.delete_trigger(guild_id, &name).await {
                            error!("Failed to delete trigger {} in guild {}: {:?}", name, guild_id, e);
                        }
                    }
                    StoreOp::SetOption(guild_id, key, value) => {
                        if let Err(e) = store.set_guild_option(guild_id, &key, &value).await {
                            error!("Failed to save option {} in guild {}: {:?}", key, guild_id, e);
                        }
                    }
                    StoreOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            info!("Storage writer stopped");
        });
        (Self { tx }, handle)
    }

    fn send(&self, op: StoreOp) {
        if self.tx.send(op).is_err() {
            error!("Storage writer is gone, dropping a write");
        }
    }

    pub fn save(&self, guild_id: GuildId, record: TriggerRecord) {
        self.send(StoreOp::Save(guild_id, record));
    }

    pub fn delete(&self, guild_id: GuildId, name: &str) {
        self.send(StoreOp::Delete(guild_id, name.to_string()));
    }

    pub fn set_option(&self, guild_id: GuildId, key: &str, value: &str) {
        self.send(StoreOp::SetOption(guild_id, key.to_string(), value.to_string()));
    }

    /// Resolves once everything queued before it has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(StoreOp::Flush(done));
        let _ = wait.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{Response, Trigger};
    use serenity::model::id::UserId;

    fn record(name: &str, count: u64) -> TriggerRecord {
        let mut trigger =
            Trigger::new(name, UserId::new(5), "hi", vec![Response::Text("hey".into())], 1).unwrap();
        trigger.count = count;
        trigger.to_record()
    }

    #[tokio::test]
    async fn test_save_load_keeps_creation_order() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let guild = GuildId::new(7);
        store.save_trigger(guild, &record("zeta", 0)).await.unwrap();
        store.save_trigger(guild, &record("alpha", 0)).await.unwrap();
        // updating zeta must not move it behind alpha
        store.save_trigger(guild, &record("zeta", 3)).await.unwrap();

        let loaded = store.load_triggers(guild).await.unwrap();
        let names: Vec<&str> = loaded.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha"]);
        assert_eq!(loaded[0].count, 3);
        assert_eq!(store.guild_ids().await.unwrap(), vec![guild]);
    }

    #[tokio::test]
    async fn test_delete_and_options() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let guild = GuildId::new(8);
        store.save_trigger(guild, &record("a", 0)).await.unwrap();
        store.delete_trigger(guild, "a").await.unwrap();
        assert!(store.load_triggers(guild).await.unwrap().is_empty());

        store.set_guild_option(guild, "filter_logs", "true").await.unwrap();
        store.set_guild_option(guild, "filter_logs", "false").await.unwrap();
        assert_eq!(
            store.load_guild_options(guild).await.unwrap(),
            vec![("filter_logs".to_string(), "false".to_string())]
        );
    }

    #[tokio::test]
    async fn test_writer_applies_in_order() {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let (writer, _handle) = StoreWriter::spawn(store.clone());
        let guild = GuildId::new(9);
        for count in 1..=5 {
            writer.save(guild, record("counter", count));
        }
        writer.delete(guild, "missing");
        writer.flush().await;

        let loaded = store.load_triggers(guild).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].count, 5);
    }
}
