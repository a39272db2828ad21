use argon2::Argon2;
use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const SALT_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("failed to create data directory: {0}")]
    Io(#[from] std::io::Error),
}

/// SQLite-backed user credentials and friend edges.
///
/// A friend edge is a directional row `(owner, friend, accepted)`; an accepted
/// friendship is two accepted rows. All queries run on a blocking thread.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open `motmot.db` under `data_dir`, or an in-memory database when `None`.
    pub fn open(data_dir: Option<&Path>) -> Result<Self, StoreError> {
        let conn = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Connection::open(dir.join("motmot.db"))?
            }
            None => Connection::open_in_memory()?,
        };

        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                username       TEXT PRIMARY KEY NOT NULL,
                salt           TEXT NOT NULL,
                password_hash  TEXT NOT NULL,
                created_at     TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS friends (
                owner       TEXT NOT NULL,
                friend      TEXT NOT NULL,
                accepted    INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (owner, friend)
            );
            CREATE INDEX IF NOT EXISTS idx_friends_friend ON friends(friend);",
        )?;

        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap_or(0);
        if users > 0 {
            tracing::info!(users, "loaded user directory");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    pub async fn count_friend_edge(&self, owner: &str, friend: &str) -> Result<i64, StoreError> {
        let (owner, friend) = (owner.to_string(), friend.to_string());
        self.run(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM friends WHERE owner = ?1 AND friend = ?2",
                params![owner, friend],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// Insert a pending edge. Returns false if the edge already existed.
    pub async fn insert_friend_edge(&self, owner: &str, friend: &str) -> Result<bool, StoreError> {
        let (owner, friend) = (owner.to_string(), friend.to_string());
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO friends (owner, friend, accepted) VALUES (?1, ?2, 0)",
                params![owner, friend],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    /// Delete one directional edge.
    pub async fn delete_friend_edge(&self, owner: &str, friend: &str) -> Result<bool, StoreError> {
        let (owner, friend) = (owner.to_string(), friend.to_string());
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM friends WHERE owner = ?1 AND friend = ?2",
                params![owner, friend],
            )?;
            Ok(deleted == 1)
        })
        .await
    }

    /// Delete both directions of a relationship in one transaction.
    pub async fn delete_friend_pair(&self, a: &str, b: &str) -> Result<usize, StoreError> {
        let (a, b) = (a.to_string(), b.to_string());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM friends
                 WHERE (owner = ?1 AND friend = ?2) OR (owner = ?2 AND friend = ?1)",
                params![a, b],
            )?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Mark one edge accepted. Returns false if the edge does not exist.
    pub async fn set_accepted(&self, owner: &str, friend: &str) -> Result<bool, StoreError> {
        let (owner, friend) = (owner.to_string(), friend.to_string());
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE friends SET accepted = 1 WHERE owner = ?1 AND friend = ?2",
                params![owner, friend],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Return an accepted edge to pending.
    pub async fn set_pending(&self, owner: &str, friend: &str) -> Result<bool, StoreError> {
        let (owner, friend) = (owner.to_string(), friend.to_string());
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE friends SET accepted = 0 WHERE owner = ?1 AND friend = ?2",
                params![owner, friend],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Mark both directions accepted atomically. Missing rows are created
    /// so a local pair never ends up half-accepted.
    pub async fn accept_pair(&self, a: &str, b: &str) -> Result<(), StoreError> {
        let (a, b) = (a.to_string(), b.to_string());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for (owner, friend) in [(&a, &b), (&b, &a)] {
                tx.execute(
                    "INSERT INTO friends (owner, friend, accepted) VALUES (?1, ?2, 1)
                     ON CONFLICT(owner, friend) DO UPDATE SET accepted = 1",
                    params![owner, friend],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn is_accepted(&self, owner: &str, friend: &str) -> Result<bool, StoreError> {
        let (owner, friend) = (owner.to_string(), friend.to_string());
        self.run(move |conn| {
            let accepted: Option<bool> = conn
                .query_row(
                    "SELECT accepted FROM friends WHERE owner = ?1 AND friend = ?2",
                    params![owner, friend],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(accepted.unwrap_or(false))
        })
        .await
    }

    /// Friends `owner` has accepted.
    pub async fn list_accepted_friends(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let owner = owner.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT friend FROM friends WHERE owner = ?1 AND accepted = 1 ORDER BY friend",
            )?;
            let rows = stmt.query_map([owner], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
        .await
    }

    /// Owners holding an accepted edge toward `friend`.
    pub async fn list_accepted_owners(&self, friend: &str) -> Result<Vec<String>, StoreError> {
        let friend = friend.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT owner FROM friends WHERE friend = ?1 AND accepted = 1 ORDER BY owner",
            )?;
            let rows = stmt.query_map([friend], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
        .await
    }

    /// Create or replace a user credential.
    pub async fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let (username, password) = (username.to_string(), password.to_string());
        self.run(move |conn| {
            let mut salt = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            let hash = derive_key(&password, &salt)?;
            conn.execute(
                "INSERT INTO users (username, salt, password_hash) VALUES (?1, ?2, ?3)
                 ON CONFLICT(username) DO UPDATE SET salt = ?2, password_hash = ?3",
                params![username, hex::encode(salt), hex::encode(hash)],
            )?;
            Ok(())
        })
        .await
    }

    /// 1 when `username` exists and `password` matches, 0 otherwise.
    pub async fn count_user_credential(
        &self,
        username: &str,
        password: &str,
    ) -> Result<i64, StoreError> {
        let (username, password) = (username.to_string(), password.to_string());
        self.run(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT salt, password_hash FROM users WHERE username = ?1",
                    [&username],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((salt_hex, hash_hex)) = row else {
                return Ok(0);
            };
            let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(hash_hex)) else {
                tracing::warn!(%username, "corrupt credential row");
                return Ok(0);
            };
            let actual = derive_key(&password, &salt)?;
            Ok(i64::from(actual.as_slice() == expected.as_slice()))
        })
        .await
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], StoreError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| StoreError::Hash(e.to_string()))?;
    Ok(key)
}
