//! Postgres-backed directory
//!
//! Concrete `DirectoryStore` over the `extension_ia` schema plus a
//! `DirectoryWatcher` built on LISTEN/NOTIFY. The watcher reconnects with a
//! backoff on lost connections; while it is down, listeners keep serving
//! with their last configuration.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};

use crate::store::{DirectoryChange, DirectoryStore, DirectoryWatcher};
use crate::types::{DirectoryEntry, ExtensionRecord};
use crate::DirectoryError;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_CONNECTIONS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Directory store over a Postgres pool
pub struct PgDirectoryStore {
    pool: PgPool,
}

impl PgDirectoryStore {
    pub async fn connect(database_url: &str) -> Result<Self, DirectoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DirectoryStore for PgDirectoryStore {
    async fn list_extensions(&self) -> Result<Vec<ExtensionRecord>, DirectoryError> {
        // Ports are stored as padded text in the source schema.
        let rows = sqlx::query(
            "SELECT extension_ia_id,
                    TRIM(extension_ia_number) AS extension_ia_number,
                    TRIM(extension_ia_return) AS extension_ia_return,
                    TRIM(extension_ia_ip) AS extension_ia_ip,
                    TRIM(extension_ia_number_port) AS extension_ia_number_port,
                    TRIM(extension_ia_return_port) AS extension_ia_return_port,
                    condominium_id
             FROM public.extension_ia
             ORDER BY extension_ia_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i32 = row.try_get("extension_ia_id")?;
            let ia_number: String = row.try_get("extension_ia_number")?;
            let return_number: String = row.try_get("extension_ia_return")?;
            let bind_ip: String = row.try_get("extension_ia_ip")?;
            let ia_port: String = row.try_get("extension_ia_number_port")?;
            let return_port: String = row.try_get("extension_ia_return_port")?;
            let building_id: i32 = row.try_get("condominium_id")?;

            let parse_port = |raw: &str, field: &str| -> Result<u16, DirectoryError> {
                raw.parse::<u16>().map_err(|_| {
                    DirectoryError::Malformed(format!("{field} is not a port: {raw:?}"))
                })
            };

            records.push(ExtensionRecord {
                id: id as i64,
                ia_number,
                return_number,
                bind_ip,
                ia_port: parse_port(&ia_port, "extension_ia_number_port")?,
                return_port: parse_port(&return_port, "extension_ia_return_port")?,
                building_id: building_id as i64,
            });
        }

        tracing::info!(count = records.len(), "loaded extensions from directory");
        Ok(records)
    }

    async fn find_apartment(
        &self,
        apartment: &str,
    ) -> Result<Option<DirectoryEntry>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT TRIM(resident_name) AS resident_name,
                    TRIM(voip_number) AS voip_number
             FROM public.apartment_directory
             WHERE TRIM(apartment) = $1
             ORDER BY resident_name",
        )
        .bind(apartment.trim())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut residents = Vec::with_capacity(rows.len());
        let mut voip_number = String::new();
        for row in rows {
            let name: String = row.try_get("resident_name")?;
            residents.push(name);
            if voip_number.is_empty() {
                voip_number = row.try_get("voip_number")?;
            }
        }

        Ok(Some(DirectoryEntry {
            apartment: apartment.trim().to_string(),
            residents,
            voip_number,
        }))
    }
}

/// LISTEN/NOTIFY watcher with reconnect backoff
pub struct PgDirectoryWatcher {
    database_url: String,
    channel: String,
    listener: Option<PgListener>,
}

impl PgDirectoryWatcher {
    pub fn new(database_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            channel: channel.into(),
            listener: None,
        }
    }

    async fn ensure_listener(&mut self) {
        while self.listener.is_none() {
            match PgListener::connect(&self.database_url).await {
                Ok(mut listener) => match listener.listen(&self.channel).await {
                    Ok(()) => {
                        tracing::info!(channel = %self.channel, "directory watcher connected");
                        self.listener = Some(listener);
                    }
                    Err(err) => {
                        tracing::warn!(%err, "LISTEN failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
                Err(err) => {
                    tracing::warn!(%err, "directory watcher connect failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl DirectoryWatcher for PgDirectoryWatcher {
    async fn next_change(&mut self) -> Result<DirectoryChange, DirectoryError> {
        loop {
            self.ensure_listener().await;
            let Some(listener) = self.listener.as_mut() else {
                continue;
            };

            match listener.recv().await {
                Ok(notification) => match DirectoryChange::from_payload(notification.payload()) {
                    Ok(change) => return Ok(change),
                    Err(err) => {
                        // One bad payload must not kill the watcher.
                        tracing::error!(%err, "ignoring malformed change notification");
                    }
                },
                Err(err) => {
                    tracing::warn!(%err, "directory notification channel lost, reconnecting");
                    self.listener = None;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
