//! Redis-backed presence store.
//!
//! Each device is a sorted set `{prefix}:{tenant_id}:{device_id}` whose members
//! are connection ids scored by their expiry in unix milliseconds. A node that
//! dies without cleaning up stops refreshing its members, and they fall out of
//! every count once their score passes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;

use crate::connection_manager::{ConnectionId, DeviceKey};
use crate::redis::{current_time_ms, RedisPool};

use super::store::{PresenceError, PresenceStore, SetMutation};

const ADD_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
local added = redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
local card = redis.call('ZCARD', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return {added, card}
"#;

const REMOVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local removed = redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
local card = redis.call('ZCARD', KEYS[1])
if card == 0 then
    redis.call('DEL', KEYS[1])
end
return {removed, card}
"#;

pub struct RedisPresenceStore {
    pool: Arc<RedisPool>,
    prefix: String,
    add_script: Script,
    remove_script: Script,
}

impl RedisPresenceStore {
    pub fn new(pool: Arc<RedisPool>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            add_script: Script::new(ADD_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        }
    }

    fn device_key(&self, device: &DeviceKey) -> String {
        format!("{}:{}:{}", self.prefix, device.tenant_id, device.device_id)
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    ttl.as_millis().min(i64::MAX as u128) as i64
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn add_connection(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> Result<SetMutation, PresenceError> {
        let key = self.device_key(device);
        let now = current_time_ms();
        let ttl = ttl_ms(ttl);
        let member = connection_id.to_string();
        let script = self.add_script.clone();

        let (added, cardinality): (i64, i64) = self
            .pool
            .execute(|mut conn| async move {
                script
                    .key(&key)
                    .arg(now)
                    .arg(now + ttl)
                    .arg(&member)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        tracing::debug!(
            device = %device,
            connection_id = %connection_id,
            cardinality = cardinality,
            "Presence member added"
        );

        Ok(SetMutation {
            changed: added > 0,
            cardinality: cardinality.max(0) as u64,
        })
    }

    async fn remove_connection(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
    ) -> Result<SetMutation, PresenceError> {
        let key = self.device_key(device);
        let now = current_time_ms();
        let member = connection_id.to_string();
        let script = self.remove_script.clone();

        let (removed, cardinality): (i64, i64) = self
            .pool
            .execute(|mut conn| async move {
                script
                    .key(&key)
                    .arg(now)
                    .arg(&member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        tracing::debug!(
            device = %device,
            connection_id = %connection_id,
            cardinality = cardinality,
            "Presence member removed"
        );

        Ok(SetMutation {
            changed: removed > 0,
            cardinality: cardinality.max(0) as u64,
        })
    }

    async fn connection_count(&self, device: &DeviceKey) -> Result<u64, PresenceError> {
        let counts = self.connection_counts(std::slice::from_ref(device)).await?;
        Ok(counts.first().copied().unwrap_or(0))
    }

    async fn connection_counts(&self, devices: &[DeviceKey]) -> Result<Vec<u64>, PresenceError> {
        if devices.is_empty() {
            return Ok(Vec::new());
        }

        let min = format!("({}", current_time_ms());
        let mut pipe = redis::pipe();
        for device in devices {
            pipe.cmd("ZCOUNT").arg(self.device_key(device)).arg(&min).arg("+inf");
        }

        let counts: Vec<u64> = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        Ok(counts)
    }

    async fn refresh(
        &self,
        entries: &[(DeviceKey, ConnectionId)],
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        if entries.is_empty() {
            return Ok(());
        }

        let ttl = ttl_ms(ttl);
        let expiry = current_time_ms() + ttl;
        let mut pipe = redis::pipe();
        for (device, connection_id) in entries {
            let key = self.device_key(device);
            pipe.cmd("ZADD")
                .arg(&key)
                .arg("XX")
                .arg(expiry)
                .arg(connection_id.to_string())
                .ignore()
                .cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl)
                .ignore();
        }

        let _: () = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        tracing::debug!(entries = entries.len(), "Presence TTLs refreshed");

        Ok(())
    }
}
