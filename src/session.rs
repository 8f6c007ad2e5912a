//! Session records guarded by a [`SessionLock`].

use crate::config::SessionConfig;
use crate::error::LockError;
use crate::lock::SessionLock;
use crate::Client;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

/// Reads and writes opaque session blobs, holding the session's lock in between.
///
/// A read takes the lock; it stays held, refreshed by every write, until the store is closed,
/// the session destroyed or the store dropped.
pub struct SessionStore {
    client: Client,
    config: SessionConfig,
    lock: SessionLock,
    /// Session whose lock is held.
    session_id: Option<String>,
    /// SHA-1 of the last value read or written for `session_id`.
    fingerprint: Option<String>,
}

impl SessionStore {
    pub fn new(client: Client, config: SessionConfig) -> SessionStore {
        SessionStore {
            lock: SessionLock::from_config(&config),
            client,
            config,
            session_id: None,
            fingerprint: None,
        }
    }

    pub fn record_key(&self, id: &str) -> String {
        format!("{}{}", self.config.prefix, id)
    }

    pub fn lock_key(&self, id: &str) -> String {
        format!("{}{}:lock", self.config.prefix, id)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Locks session `id` and returns its value, empty when there is none.
    ///
    /// Failing to lock is an error: the caller must not touch the session unlocked.
    #[instrument(skip(self))]
    pub async fn read(&mut self, id: &str) -> crate::Result<Bytes> {
        self.leave_other(id).await?;

        let lock_key = self.lock_key(id);
        self.lock.acquire(&mut self.client, &lock_key).await?;
        self.session_id = Some(id.to_string());

        let record_key = self.record_key(id);
        let value = self.client.get(&record_key).await?;
        self.fingerprint = value.as_deref().map(fingerprint);

        Ok(value.unwrap_or_default())
    }

    /// Stores `data` for session `id`, moving the lock if `id` is not the locked session.
    ///
    /// When `data` is unchanged since the last read or write only the record's TTL is
    /// refreshed.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write(&mut self, id: &str, data: &[u8]) -> crate::Result<()> {
        if self.session_id.as_deref() == Some(id) && self.lock.is_held() {
            self.lock.refresh(&mut self.client).await?;
        } else {
            self.leave_other(id).await?;

            let lock_key = self.lock_key(id);
            self.lock.acquire(&mut self.client, &lock_key).await?;
            self.session_id = Some(id.to_string());
        }

        let record_key = self.record_key(id);
        let digest = fingerprint(data);

        if self.fingerprint.as_deref() == Some(digest.as_str()) {
            debug!(key = record_key.as_str(), "session unchanged, touching ttl");
            self.client.expire(&record_key, self.config.ttl).await?;
        } else {
            self.client
                .set_ex(&record_key, self.config.ttl, Bytes::copy_from_slice(data))
                .await?;
            self.fingerprint = Some(digest);
        }

        Ok(())
    }

    /// Releases the lock of the current session when `id` names another one.
    ///
    /// A failed release is an error, so a store never ends up holding two locks.
    async fn leave_other(&mut self, id: &str) -> crate::Result<()> {
        if self.session_id.as_deref() == Some(id) {
            return Ok(());
        }

        let stuck = match self.lock.held_key().map(str::to_string) {
            Some(old) if !self.lock.release(&mut self.client).await => Some(old),
            _ => None,
        };

        // The old session is no longer ours either way.
        self.session_id = None;
        self.fingerprint = None;

        match stuck {
            Some(key) => Err(LockError::Release { key }.into()),
            None => Ok(()),
        }
    }

    /// Deletes session `id` and releases its lock.
    #[instrument(skip(self))]
    pub async fn destroy(&mut self, id: &str) -> crate::Result<()> {
        let record_key = self.record_key(id);
        self.client.del(&[record_key.as_str()]).await?;

        if self.session_id.as_deref() == Some(id) {
            self.close().await;
        }

        Ok(())
    }

    /// Releases the lock. Never fails.
    pub async fn close(&mut self) {
        self.lock.release(&mut self.client).await;
        self.session_id = None;
        self.fingerprint = None;
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if !self.lock.is_held() {
            return;
        }

        let mut lock = self.lock.take();

        match Handle::try_current() {
            Ok(handle) => {
                let fresh = self.client.detached();
                let mut client = std::mem::replace(&mut self.client, fresh);

                handle.spawn(async move {
                    lock.release(&mut client).await;
                });
            }
            Err(_) => {
                warn!(key = ?lock.held_key(), "no runtime to release lock, leaving it to expire");
            }
        }
    }
}

/// Hex SHA-1 of a session value.
fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}
