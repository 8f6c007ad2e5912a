//! Advisory lock built on `SET NX EX` and `EXPIRE`.
//!
//! The server is the only source of truth for who holds a lock; this type just remembers
//! whether *we* think we hold it. Acquisition checks the remaining TTL, backs off while another
//! holder is alive and then tries a conditional set. The check and the set are two separate
//! round trips, so two contenders can both see the key expire and race on the set; only one of
//! them wins the `NX`, and the loser keeps retrying.

use crate::cmd::Set;
use crate::config::SessionConfig;
use crate::error::LockError;
use crate::Client;

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time;
use tracing::{debug, instrument, warn};

const CATEGORY: &str = "session";

/// A lock on one key, held at most once at a time.
#[derive(Debug, Clone)]
pub struct SessionLock {
    ttl: Duration,
    attempts: u32,
    backoff: Duration,
    /// Key we currently hold. `None` when unlocked.
    held: Option<String>,
}

impl SessionLock {
    pub fn new(ttl: Duration, attempts: u32, backoff: Duration) -> SessionLock {
        SessionLock {
            ttl,
            attempts,
            backoff,
            held: None,
        }
    }

    pub fn from_config(config: &SessionConfig) -> SessionLock {
        SessionLock::new(config.lock_ttl, config.lock_attempts, config.lock_backoff)
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn held_key(&self) -> Option<&str> {
        self.held.as_deref()
    }

    /// Moves the held state into a new value, leaving `self` unlocked.
    pub(crate) fn take(&mut self) -> SessionLock {
        SessionLock {
            held: self.held.take(),
            ..self.clone()
        }
    }

    /// Acquires `key`.
    ///
    /// Acquiring the key already held only refreshes its TTL. Holding a different key releases
    /// that one first, and a failed release fails the acquisition. A key found without any TTL
    /// is reported as orphaned straight away.
    #[instrument(skip(self, client))]
    pub async fn acquire(&mut self, client: &mut Client, key: &str) -> crate::Result<()> {
        if self.held.as_deref() == Some(key) {
            if client.expire(key, self.ttl).await? {
                return Ok(());
            }

            // The key expired under us. Start over.
            warn!(key, "held lock vanished, reacquiring");
            client
                .sink()
                .log_error(CATEGORY, &format!("lock {} vanished while held", key));
            self.held = None;
        } else if let Some(old) = self.held.clone() {
            if !self.release(client).await {
                return Err(LockError::Release { key: old }.into());
            }
        }

        for attempt in 1..=self.attempts {
            let ttl = client.ttl(key).await?;

            if ttl == -1 {
                client
                    .sink()
                    .log_error(CATEGORY, &format!("lock {} has no ttl", key));
                return Err(LockError::Orphaned {
                    key: key.to_string(),
                }
                .into());
            }

            if ttl > 0 {
                debug!(key, attempt, ttl, "lock busy, backing off");
                time::sleep(self.backoff).await;
            }

            let set = Set::new(key, timestamp()).expire(self.ttl).nx();

            if client.set_with(set).await? {
                debug!(key, attempt, "lock acquired");
                self.held = Some(key.to_string());
                return Ok(());
            }
        }

        Err(LockError::Contended {
            key: key.to_string(),
            attempts: self.attempts,
        }
        .into())
    }

    /// Extends the TTL of the held lock.
    pub async fn refresh(&mut self, client: &mut Client) -> crate::Result<()> {
        let key = match self.held.clone() {
            Some(key) => key,
            None => return Err(LockError::NotHeld.into()),
        };

        self.acquire(client, &key).await
    }

    /// Releases the held lock, if any.
    ///
    /// Never fails: problems are logged and reported as `false`. Releasing an unheld lock is a
    /// no-op returning `true`.
    #[instrument(skip(self, client))]
    pub async fn release(&mut self, client: &mut Client) -> bool {
        let key = match self.held.take() {
            Some(key) => key,
            None => return true,
        };

        match client.del(&[key.as_str()]).await {
            Ok(_) => {
                debug!(key = key.as_str(), "lock released");
                true
            }
            Err(err) => {
                warn!(key = key.as_str(), cause = %err, "lock release failed");
                client
                    .sink()
                    .log_error(CATEGORY, &format!("unable to release lock {}: {}", key, err));
                false
            }
        }
    }
}

/// Lock value: seconds since the epoch at acquisition time.
fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    secs.to_string()
}
