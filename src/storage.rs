use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
#[cfg(feature = "persistence")]
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tokio::{fs, io::AsyncWriteExt};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{BloomError, Result};

/// Durable key-value persistence for serialized session blobs.
///
/// Each key holds exactly one value; `set` replaces it whole.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Stores each key as `<dir>/<key>.json`.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BloomError::Storage(format!(
                "failed to read `{}`: {err}",
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(|err| {
            BloomError::Storage(format!("failed to create `{}`: {err}", self.dir.display()))
        })?;

        // temp file + rename: readers only ever see a complete blob
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await.map_err(|err| {
            BloomError::Storage(format!("failed to open `{}`: {err}", tmp.display()))
        })?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|err| BloomError::Storage(format!("failed to persist session: {err}")))?;
        file.flush()
            .await
            .map_err(|err| BloomError::Storage(format!("failed to persist session: {err}")))?;
        drop(file);
        fs::rename(&tmp, &path).await.map_err(|err| {
            BloomError::Storage(format!("failed to replace `{}`: {err}", path.display()))
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        fs::remove_file(&path)
            .await
            .or_else(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(err)
                }
            })
            .map_err(|err| BloomError::Storage(format!("failed clearing `{}`: {err}", path.display())))
    }
}

/// Process-local store, used for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| BloomError::Storage("in-memory store poisoned".into()))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// SQLite-backed store; one row per key.
#[cfg(feature = "persistence")]
pub struct SqlSessionStore {
    pool: SqlitePool,
}

#[cfg(feature = "persistence")]
impl SqlSessionStore {
    const INIT_STATEMENT: &'static str = r#"
        CREATE TABLE IF NOT EXISTS sessions (
            key TEXT PRIMARY KEY,
            payload TEXT NOT NULL
        )
    "#;

    pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(connection_url.as_ref())
            .await
            .map_err(|err| {
                BloomError::Storage(format!(
                    "failed connecting to SQL backend `{}`: {err}",
                    connection_url.as_ref()
                ))
            })?;

        sqlx::query(Self::INIT_STATEMENT)
            .execute(&pool)
            .await
            .map_err(|err| BloomError::Storage(format!("failed initializing schema: {err}")))?;

        Ok(Self { pool })
    }
}

#[cfg(feature = "persistence")]
#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT payload FROM sessions WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| BloomError::Storage(format!("failed loading session: {err}")))?;

        row.map(|row| {
            row.try_get::<String, _>("payload").map_err(|err| {
                BloomError::Storage(format!("failed decoding session payload: {err}"))
            })
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (key, payload) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|err| BloomError::Storage(format!("failed writing session: {err}")))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| BloomError::Storage(format!("failed clearing session: {err}")))
    }
}

/// Opens the store selected by `cfg.backend`.
pub async fn open_store(cfg: &StorageConfig) -> Result<Arc<dyn SessionStore>> {
    match cfg.backend {
        StorageBackend::File => Ok(Arc::new(FileSessionStore::new(&cfg.path))),
        StorageBackend::Memory => Ok(Arc::new(InMemorySessionStore::new())),
        #[cfg(feature = "persistence")]
        StorageBackend::Sqlite => {
            let url = cfg
                .database_url
                .as_deref()
                .unwrap_or("sqlite://sessions.db?mode=rwc");
            Ok(Arc::new(SqlSessionStore::connect(url).await?))
        }
        #[cfg(not(feature = "persistence"))]
        StorageBackend::Sqlite => Err(BloomError::Config(
            "sqlite storage requires the `persistence` feature".into(),
        )),
    }
}
