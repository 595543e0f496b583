#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use chrono::Utc;
use roomcast_domain::{GroupId, MessageId, RoomId};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{GroupDirectory, GroupRecord, MessageStore, NewMessage, StoredMessage};

/// Database-backed store. The backend is picked from the URL scheme at
/// connect time; ids and timestamps are assigned in-process so a
/// successful insert already holds the authoritative row.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			debug!(backend = "sqlite", "sql store pool opened");
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			debug!(backend = "postgres", "sql store pool opened");
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			debug!(backend = "mysql", "sql store pool opened");
			Ok(Self {
				backend: SqlBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (expected sqlite:, postgres:, or mysql:)"))
		}
	}

	/// Create the `groups` / `messages` tables when absent.
	pub async fn ensure_schema(&self) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS groups (id TEXT PRIMARY KEY, name TEXT NOT NULL, room_id TEXT NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create groups (sqlite)")?;
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS messages (id TEXT PRIMARY KEY, content TEXT NOT NULL, \
					sender_id TEXT NOT NULL, group_id TEXT NOT NULL, created_at TEXT NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create messages (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS groups (id TEXT PRIMARY KEY, name TEXT NOT NULL, room_id TEXT NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create groups (postgres)")?;
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS messages (id TEXT PRIMARY KEY, content TEXT NOT NULL, \
					sender_id TEXT NOT NULL, group_id TEXT NOT NULL, created_at TIMESTAMPTZ NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create messages (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS groups (id VARCHAR(64) PRIMARY KEY, name VARCHAR(255) NOT NULL, \
					room_id VARCHAR(255) NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create groups (mysql)")?;
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS messages (id VARCHAR(64) PRIMARY KEY, content TEXT NOT NULL, \
					sender_id VARCHAR(255) NOT NULL, group_id VARCHAR(64) NOT NULL, created_at DATETIME(6) NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create messages (mysql)")?;
			}
		}

		Ok(())
	}
}

#[async_trait::async_trait]
impl GroupDirectory for SqlStore {
	async fn find_by_room_id(&self, room_id: &RoomId) -> anyhow::Result<Option<GroupRecord>> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row = sqlx::query("SELECT id, name, room_id FROM groups WHERE room_id = ? LIMIT 1")
					.bind(room_id.as_str())
					.fetch_optional(pool)
					.await
					.context("find group (sqlite)")?;
				row.map(|row| {
					Ok(GroupRecord {
						id: GroupId::new(row.try_get::<String, _>("id")?)?,
						name: row.try_get("name")?,
						room_id: RoomId::new(row.try_get::<String, _>("room_id")?)?,
					})
				})
				.transpose()
			}
			SqlBackend::Postgres(pool) => {
				let row = sqlx::query("SELECT id, name, room_id FROM groups WHERE room_id = $1 LIMIT 1")
					.bind(room_id.as_str())
					.fetch_optional(pool)
					.await
					.context("find group (postgres)")?;
				row.map(|row| {
					Ok(GroupRecord {
						id: GroupId::new(row.try_get::<String, _>("id")?)?,
						name: row.try_get("name")?,
						room_id: RoomId::new(row.try_get::<String, _>("room_id")?)?,
					})
				})
				.transpose()
			}
			SqlBackend::Mysql(pool) => {
				let row = sqlx::query("SELECT id, name, room_id FROM groups WHERE room_id = ? LIMIT 1")
					.bind(room_id.as_str())
					.fetch_optional(pool)
					.await
					.context("find group (mysql)")?;
				row.map(|row| {
					Ok(GroupRecord {
						id: GroupId::new(row.try_get::<String, _>("id")?)?,
						name: row.try_get("name")?,
						room_id: RoomId::new(row.try_get::<String, _>("room_id")?)?,
					})
				})
				.transpose()
			}
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn insert_message(&self, message: NewMessage) -> anyhow::Result<StoredMessage> {
		let stored = StoredMessage {
			id: MessageId::new(Uuid::new_v4().to_string())?,
			content: message.content,
			sender_id: message.sender_id,
			group_id: message.group_id,
			created_at: Utc::now(),
		};

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, content, sender_id, group_id, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(stored.id.as_str())
				.bind(&stored.content)
				.bind(&stored.sender_id)
				.bind(stored.group_id.as_str())
				.bind(stored.created_at)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, content, sender_id, group_id, created_at) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(stored.id.as_str())
				.bind(&stored.content)
				.bind(&stored.sender_id)
				.bind(stored.group_id.as_str())
				.bind(stored.created_at)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, content, sender_id, group_id, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(stored.id.as_str())
				.bind(&stored.content)
				.bind(&stored.sender_id)
				.bind(stored.group_id.as_str())
				.bind(stored.created_at)
				.execute(pool)
				.await
				.context("insert message (mysql)")?;
			}
		}

		Ok(stored)
	}

	async fn list_messages(&self, group_id: &GroupId) -> anyhow::Result<Vec<StoredMessage>> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let rows = sqlx::query(
					"SELECT id, content, sender_id, group_id, created_at FROM messages \
					WHERE group_id = ? ORDER BY created_at ASC",
				)
				.bind(group_id.as_str())
				.fetch_all(pool)
				.await
				.context("list messages (sqlite)")?;
				let mut messages = Vec::with_capacity(rows.len());
				for row in rows {
					messages.push(StoredMessage {
						id: MessageId::new(row.try_get::<String, _>("id")?)?,
						content: row.try_get("content")?,
						sender_id: row.try_get("sender_id")?,
						group_id: GroupId::new(row.try_get::<String, _>("group_id")?)?,
						created_at: row.try_get("created_at")?,
					});
				}
				Ok(messages)
			}
			SqlBackend::Postgres(pool) => {
				let rows = sqlx::query(
					"SELECT id, content, sender_id, group_id, created_at FROM messages \
					WHERE group_id = $1 ORDER BY created_at ASC",
				)
				.bind(group_id.as_str())
				.fetch_all(pool)
				.await
				.context("list messages (postgres)")?;
				let mut messages = Vec::with_capacity(rows.len());
				for row in rows {
					messages.push(StoredMessage {
						id: MessageId::new(row.try_get::<String, _>("id")?)?,
						content: row.try_get("content")?,
						sender_id: row.try_get("sender_id")?,
						group_id: GroupId::new(row.try_get::<String, _>("group_id")?)?,
						created_at: row.try_get("created_at")?,
					});
				}
				Ok(messages)
			}
			SqlBackend::Mysql(pool) => {
				let rows = sqlx::query(
					"SELECT id, content, sender_id, group_id, created_at FROM messages \
					WHERE group_id = ? ORDER BY created_at ASC",
				)
				.bind(group_id.as_str())
				.fetch_all(pool)
				.await
				.context("list messages (mysql)")?;
				let mut messages = Vec::with_capacity(rows.len());
				for row in rows {
					messages.push(StoredMessage {
						id: MessageId::new(row.try_get::<String, _>("id")?)?,
						content: row.try_get("content")?,
						sender_id: row.try_get("sender_id")?,
						group_id: GroupId::new(row.try_get::<String, _>("group_id")?)?,
						created_at: row.try_get("created_at")?,
					});
				}
				Ok(messages)
			}
		}
	}
}
