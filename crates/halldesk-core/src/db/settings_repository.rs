//! Settings repository implementation

use crate::error::Result;
use crate::models::DeviceId;
use libsql::{params, Connection};

const DEVICE_ID_KEY: &str = "device_id";

/// Trait for key/value settings storage (async)
#[allow(async_fn_in_trait)]
pub trait SettingsRepository {
    /// Read a setting, `None` when unset
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a setting
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// The persisted device id, generating and storing one on first use
    async fn load_or_create_device_id(&self) -> Result<DeviceId>;
}

/// libSQL implementation of `SettingsRepository`
pub struct LibSqlSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for LibSqlSettingsRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM settings WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                params![key, value],
            )
            .await?;
        Ok(())
    }

    async fn load_or_create_device_id(&self) -> Result<DeviceId> {
        if let Some(stored) = self.get(DEVICE_ID_KEY).await? {
            match DeviceId::new(stored) {
                Ok(device) => return Ok(device),
                Err(error) => tracing::warn!("Replacing invalid stored device id: {error}"),
            }
        }

        let device = DeviceId::generate();
        self.set(DEVICE_ID_KEY, device.as_str()).await?;
        tracing::info!("Generated device id {device}");
        Ok(device)
    }
}
