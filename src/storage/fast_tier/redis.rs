//! Redis-based fast tier.
//!
//! Records are plain string keys `evt:<fingerprint>` holding `1`, created with
//! `SET key 1 NX EX ttl`. Redis expires them; nothing ever deletes them.
//!
//! # Connection Management
//!
//! One connection is cached per instance in a `Mutex<Option<Connection>>`.
//! Callers take it, use it and return it on success. A connection that failed a
//! command is dropped so the next call reconnects. Concurrent callers that find
//! the cache empty open their own connection.
//!
//! # Timeouts
//!
//! Connect, read and write timeouts come from configuration. Exceeding any of
//! them surfaces as [`crate::Error::CacheUnavailable`].

#[cfg(feature = "redis")]
mod implementation {
    use crate::models::Fingerprint;
    use crate::storage::traits::FastTier;
    use crate::{Error, Result};
    use redis::{Client, Connection};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use tracing::instrument;

    /// Default timeout for Redis operations.
    pub const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_secs(5);

    /// Fast tier backed by Redis.
    pub struct RedisFastTier {
        client: Client,
        timeout: Duration,
        connection: Mutex<Option<Connection>>,
    }

    impl RedisFastTier {
        /// Creates a Redis fast tier.
        ///
        /// The URL is validated eagerly; the first connection is opened lazily.
        ///
        /// # Errors
        ///
        /// Returns [`Error::CacheUnavailable`] if the URL is invalid.
        pub fn new(connection_url: &str, timeout: Duration) -> Result<Self> {
            let client = Client::open(connection_url).map_err(|e| Error::cache("connect", e))?;
            Ok(Self {
                client,
                timeout,
                connection: Mutex::new(None),
            })
        }

        /// Creates a fast tier for `redis://localhost:6379` with the default timeout.
        ///
        /// # Errors
        ///
        /// Returns [`Error::CacheUnavailable`] if the client cannot be created.
        pub fn with_defaults() -> Result<Self> {
            Self::new("redis://localhost:6379", DEFAULT_REDIS_TIMEOUT)
        }

        /// Sends `PING`, returning an error if the server is unreachable.
        ///
        /// # Errors
        ///
        /// Returns [`Error::CacheUnavailable`] on connection failure.
        pub fn ping(&self) -> Result<()> {
            self.with_connection("ping", |conn| redis::cmd("PING").query::<String>(conn))
                .map(|_| ())
        }

        fn get_connection(&self) -> Result<Connection> {
            let cached = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(conn) = cached {
                return Ok(conn);
            }

            let conn = self
                .client
                .get_connection_with_timeout(self.timeout)
                .map_err(|e| Error::cache("get_connection", e))?;
            conn.set_read_timeout(Some(self.timeout))
                .map_err(|e| Error::cache("set_read_timeout", e))?;
            conn.set_write_timeout(Some(self.timeout))
                .map_err(|e| Error::cache("set_write_timeout", e))?;
            Ok(conn)
        }

        fn return_connection(&self, conn: Connection) {
            *self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(conn);
        }

        /// Runs one command on a pooled connection.
        fn with_connection<T, F>(&self, operation: &'static str, call: F) -> Result<T>
        where
            F: FnOnce(&mut Connection) -> redis::RedisResult<T>,
        {
            let mut conn = self.get_connection()?;
            match call(&mut conn) {
                Ok(value) => {
                    self.return_connection(conn);
                    Ok(value)
                },
                Err(e) => {
                    tracing::warn!(operation, error = %e, "Redis command failed, dropping connection");
                    Err(Error::cache(operation, e))
                },
            }
        }
    }

    /// Redis `EX` takes whole seconds; sub-second TTLs round up to one.
    fn ttl_secs(ttl: Duration) -> u64 {
        let secs = ttl.as_secs();
        if ttl.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
    }

    impl FastTier for RedisFastTier {
        #[instrument(skip(self), fields(backend = "redis"))]
        fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
            let key = fingerprint.cache_key();
            self.with_connection("exists", |conn| {
                redis::cmd("EXISTS").arg(&key).query::<bool>(conn)
            })
        }

        #[instrument(skip(self), fields(backend = "redis"))]
        fn claim(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<bool> {
            let key = fingerprint.cache_key();
            let reply: Option<String> = self.with_connection("claim", |conn| {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs(ttl))
                    .query(conn)
            })?;
            Ok(reply.is_some())
        }

        #[instrument(skip(self, fingerprints), fields(backend = "redis", count = fingerprints.len()))]
        fn seed(&self, fingerprints: &[Fingerprint], ttl: Duration) -> Result<usize> {
            if fingerprints.is_empty() {
                return Ok(0);
            }
            let secs = ttl_secs(ttl);
            let mut pipe = redis::pipe();
            for fingerprint in fingerprints {
                pipe.cmd("SET")
                    .arg(fingerprint.cache_key())
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(secs);
            }
            let replies: Vec<Option<String>> =
                self.with_connection("seed", |conn| pipe.query(conn))?;
            Ok(replies.iter().filter(|r| r.is_some()).count())
        }

        fn backend_name(&self) -> &'static str {
            "redis"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_ttl_secs_rounds_up() {
            assert_eq!(ttl_secs(Duration::from_secs(604_800)), 604_800);
            assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
            assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
            assert_eq!(ttl_secs(Duration::ZERO), 1);
        }

        #[test]
        fn test_invalid_url_is_cache_unavailable() {
            let result = RedisFastTier::new("not a url", DEFAULT_REDIS_TIMEOUT);
            assert!(matches!(result, Err(Error::CacheUnavailable { .. })));
        }
    }
}

#[cfg(feature = "redis")]
pub use implementation::{DEFAULT_REDIS_TIMEOUT, RedisFastTier};

#[cfg(not(feature = "redis"))]
mod stub {
    use crate::models::Fingerprint;
    use crate::storage::traits::FastTier;
    use crate::{Error, Result};
    use std::time::Duration;

    /// Default timeout for Redis operations.
    pub const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_secs(5);

    /// Stub Redis fast tier when the feature is not enabled.
    pub struct RedisFastTier;

    impl RedisFastTier {
        /// Creates a Redis fast tier (stub).
        ///
        /// # Errors
        ///
        /// Always returns an error because the feature is not enabled.
        pub fn new(_connection_url: &str, _timeout: Duration) -> Result<Self> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }

        /// Creates a fast tier with default settings (stub).
        ///
        /// # Errors
        ///
        /// Always returns an error because the feature is not enabled.
        pub fn with_defaults() -> Result<Self> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }

        /// Pings the server (stub).
        ///
        /// # Errors
        ///
        /// Always returns an error because the feature is not enabled.
        pub fn ping(&self) -> Result<()> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }
    }

    impl FastTier for RedisFastTier {
        fn exists(&self, _fingerprint: &Fingerprint) -> Result<bool> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }

        fn claim(&self, _fingerprint: &Fingerprint, _ttl: Duration) -> Result<bool> {
            Err(Error::FeatureNotEnabled("redis".to_string()))
        }

        fn backend_name(&self) -> &'static str {
            "redis"
        }
    }
}

#[cfg(not(feature = "redis"))]
pub use stub::{DEFAULT_REDIS_TIMEOUT, RedisFastTier};
