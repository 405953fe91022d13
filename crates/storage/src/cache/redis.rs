//! Redis-backed distributed cache and lease locks for clustered mode.
//!
//! Values are stored with a small self-describing header
//! (`version | ttl_ms | sliding`) so sliding expiration can be re-armed on
//! every hit without a server-side registry of policies. Locks use the
//! usual single-instance lease pattern: SET NX PX to acquire, owner-checked
//! Lua for renew and release so one client can never drop another's lease.

use crate::cache::{CachedValue, DistributedCache};
use parking_lot::Mutex;
use redis::{Client, Connection, Script};
use sop_core::{Error, RedisCacheConfig, Result};
use std::io;
use std::time::Duration;

const KEY_PREFIX: &str = "sop:";
const VALUE_HEADER_SIZE: usize = 17;

fn to_io(e: redis::RedisError) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

fn encode_value(value: &CachedValue, ttl: Option<Duration>, sliding: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(VALUE_HEADER_SIZE + value.bytes.len());
    out.extend_from_slice(&value.version.to_le_bytes());
    let ttl_ms = ttl.map(|t| t.as_millis() as u64).unwrap_or(0);
    out.extend_from_slice(&ttl_ms.to_le_bytes());
    out.push(u8::from(sliding));
    out.extend_from_slice(&value.bytes);
    out
}

/// `(value, ttl_ms, sliding)`; `None` for foreign or truncated payloads.
fn decode_value(raw: &[u8]) -> Option<(CachedValue, u64, bool)> {
    if raw.len() < VALUE_HEADER_SIZE {
        return None;
    }
    let version = u64::from_le_bytes(raw[0..8].try_into().ok()?);
    let ttl_ms = u64::from_le_bytes(raw[8..16].try_into().ok()?);
    let sliding = raw[16] != 0;
    Some((
        CachedValue::new(version, raw[VALUE_HEADER_SIZE..].to_vec()),
        ttl_ms,
        sliding,
    ))
}

/// Distributed cache over one Redis endpoint.
pub struct RedisCache {
    conn: Mutex<Connection>,
    try_lock_script: Script,
    renew_script: Script,
    unlock_script: Script,
}

impl RedisCache {
    /// Connect using the database options' redis section.
    pub fn connect(config: &RedisCacheConfig) -> Result<Self> {
        let url = config.connection_url()?;
        let client = Client::open(url.as_str())
            .map_err(|e| Error::invalid_config(format!("redis url rejected: {}", e)))?;
        let conn = client.get_connection().map_err(to_io)?;
        Ok(RedisCache {
            conn: Mutex::new(conn),
            try_lock_script: Script::new(
                r#"
                if redis.call('exists', KEYS[1]) == 0 then
                  redis.call('set', KEYS[1], ARGV[1], 'px', ARGV[2])
                  return 1
                elseif redis.call('get', KEYS[1]) == ARGV[1] then
                  redis.call('pexpire', KEYS[1], ARGV[2])
                  return 1
                else
                  return 0
                end
                "#,
            ),
            renew_script: Script::new(
                r#"
                if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('pexpire', KEYS[1], ARGV[2])
                else
                  return 0
                end
                "#,
            ),
            unlock_script: Script::new(
                r#"
                if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('del', KEYS[1])
                else
                  return 0
                end
                "#,
            ),
        })
    }

    fn namespaced(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

impl DistributedCache for RedisCache {
    fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        let key = Self::namespaced(key);
        let mut conn = self.conn.lock();
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&key)
            .query(&mut *conn)
            .map_err(to_io)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let Some((value, ttl_ms, sliding)) = decode_value(&raw) else {
            // Foreign bytes under our prefix; drop them rather than guess.
            let _: () = redis::cmd("DEL")
                .arg(&key)
                .query(&mut *conn)
                .map_err(to_io)?;
            return Ok(None);
        };
        if sliding && ttl_ms > 0 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl_ms)
                .query(&mut *conn)
                .map_err(to_io)?;
        }
        Ok(Some(value))
    }

    fn put(
        &self,
        key: &str,
        value: CachedValue,
        ttl: Option<Duration>,
        sliding: bool,
    ) -> Result<()> {
        let key = Self::namespaced(key);
        let payload = encode_value(&value, ttl, sliding);
        let mut conn = self.conn.lock();
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(payload);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query(&mut *conn).map_err(to_io)?;
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<()> {
        let key = Self::namespaced(key);
        let mut conn = self.conn.lock();
        let _: () = redis::cmd("DEL")
            .arg(&key)
            .query(&mut *conn)
            .map_err(to_io)?;
        Ok(())
    }

    fn try_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let key = Self::namespaced(key);
        let mut conn = self.conn.lock();
        let granted: i64 = self
            .try_lock_script
            .key(&key)
            .arg(owner)
            .arg(lease.as_millis() as u64)
            .invoke(&mut *conn)
            .map_err(to_io)?;
        Ok(granted == 1)
    }

    fn renew_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let key = Self::namespaced(key);
        let mut conn = self.conn.lock();
        let renewed: i64 = self
            .renew_script
            .key(&key)
            .arg(owner)
            .arg(lease.as_millis() as u64)
            .invoke(&mut *conn)
            .map_err(to_io)?;
        Ok(renewed == 1)
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<bool> {
        let key = Self::namespaced(key);
        let mut conn = self.conn.lock();
        let removed: i64 = self
            .unlock_script
            .key(&key)
            .arg(owner)
            .invoke(&mut *conn)
            .map_err(to_io)?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_header_round_trip() {
        let value = CachedValue::new(42, b"payload".to_vec());
        let raw = encode_value(&value, Some(Duration::from_secs(300)), true);
        let (back, ttl_ms, sliding) = decode_value(&raw).unwrap();
        assert_eq!(back, value);
        assert_eq!(ttl_ms, 300_000);
        assert!(sliding);
    }

    #[test]
    fn permanent_value_has_zero_ttl() {
        let raw = encode_value(&CachedValue::new(1, vec![]), None, false);
        let (_, ttl_ms, sliding) = decode_value(&raw).unwrap();
        assert_eq!(ttl_ms, 0);
        assert!(!sliding);
    }

    #[test]
    fn foreign_bytes_decode_to_none() {
        assert!(decode_value(b"short").is_none());
    }
}
