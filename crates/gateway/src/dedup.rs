use std::time::Duration;

use {
    async_trait::async_trait,
    redis::aio::ConnectionManager,
    secrecy::{ExposeSecret, Secret},
    tokio::time::timeout,
    tracing::{debug, info},
    wapi_common::now_secs,
};

#[derive(Debug, thiserror::Error)]
#[error("dedup store unavailable: {0}")]
pub struct DedupStoreError(String);

impl From<redis::RedisError> for DedupStoreError {
    fn from(e: redis::RedisError) -> Self {
        Self(e.to_string())
    }
}

/// Shared record of which inbound message IDs were already relayed.
///
/// The ledger outlives the process and is shared by every instance pointed
/// at the same store, so a restart or a second gateway never relays a
/// message twice.
#[async_trait]
pub trait DedupLedger: Send + Sync {
    async fn already_relayed(&self, message_id: &str) -> Result<bool, DedupStoreError>;

    /// Record `message_id` as relayed; the entry expires after the ledger TTL.
    async fn mark_relayed(&self, message_id: &str) -> Result<(), DedupStoreError>;
}

// ── Redis ────────────────────────────────────────────────────────────────────

/// Bound on reaching the store at startup.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

fn startup_timeout() -> DedupStoreError {
    DedupStoreError(format!("no answer within {}s", STARTUP_TIMEOUT.as_secs()))
}

/// Ledger backed by Redis keys `<prefix><message id>` with a TTL.
pub struct RedisLedger {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl RedisLedger {
    /// Connect and PING once, so an unreachable store fails startup.
    ///
    /// The PING runs on a single plain connection: the manager retries with
    /// backoff and would never give up on a dead host.
    pub async fn connect(
        url: &Secret<String>,
        prefix: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, DedupStoreError> {
        let client = redis::Client::open(url.expose_secret().as_str())?;

        let pong: String = timeout(STARTUP_TIMEOUT, async {
            let mut probe = client.get_multiplexed_async_connection().await?;
            let pong: String = redis::cmd("PING").query_async(&mut probe).await?;
            Ok::<_, redis::RedisError>(pong)
        })
        .await
        .map_err(|_| startup_timeout())??;

        let conn = timeout(STARTUP_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| startup_timeout())??;
        info!(reply = %pong, ttl_secs = ttl.as_secs(), "dedup store reachable");
        Ok(Self {
            conn,
            prefix: prefix.into(),
            ttl,
        })
    }

    fn key(&self, message_id: &str) -> String {
        format!("{}{message_id}", self.prefix)
    }
}

#[async_trait]
impl DedupLedger for RedisLedger {
    async fn already_relayed(&self, message_id: &str) -> Result<bool, DedupStoreError> {
        let mut conn = self.conn.clone();
        let found: bool = redis::cmd("EXISTS")
            .arg(self.key(message_id))
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }

    async fn mark_relayed(&self, message_id: &str) -> Result<(), DedupStoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(message_id))
            .arg(now_secs())
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        debug!(message_id, "marked relayed");
        Ok(())
    }
}

// ── In-memory (tests) ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) use memory::MemoryLedger;
