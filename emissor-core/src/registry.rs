//! Receiver registry.
//!
//! Owns the `receivers` table. Writes go through URL and token validation
//! and tokens are sealed by the [`Vault`] before they are stored. Reads
//! return receivers with their tokens opened, served from a short-lived cache
//! that every write invalidates.
//!
//! The order of [`ReceiverRegistry::get_all`] (by id) defines the receiver
//! *index* the event producer uses to select receivers for a post.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::config::ReceiversConfig;
use crate::db::{Database, StoredReceiver};
use crate::error::{Error, Result};
use crate::types::{Receiver, ReceiverInput, ReceiverSnapshot, ReceiverStatus};
use crate::validation;
use crate::vault::Vault;

struct CachedList {
    loaded_at: Instant,
    receivers: Vec<Receiver>,
}

pub struct ReceiverRegistry {
    db: Arc<Database>,
    vault: Vault,
    config: ReceiversConfig,
    cache: Mutex<Option<CachedList>>,
}

impl ReceiverRegistry {
    pub fn new(db: Arc<Database>, vault: Vault, config: ReceiversConfig) -> Self {
        Self {
            db,
            vault,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Validate and store a new receiver.
    pub fn add(&self, input: ReceiverInput) -> Result<Receiver> {
        let (name, url) = self.checked_name_and_url(&input)?;
        let sealed = self.seal_submitted_token(input.auth_token.as_deref())?;

        let id = self
            .db
            .insert_receiver(&name, &url, sealed.as_deref(), input.status)?;
        self.invalidate();
        tracing::info!(receiver_id = id, receiver_url = %url, "Receiver added");

        self.get_by_id(id)?.ok_or(Error::ReceiverNotFound(id))
    }

    /// Validate and apply an edit.
    ///
    /// Submitting no token (or an empty one) keeps the stored token exactly
    /// as it is sealed today.
    pub fn update(&self, id: i64, input: ReceiverInput) -> Result<Receiver> {
        if self.db.get_receiver(id)?.is_none() {
            return Err(Error::ReceiverNotFound(id));
        }

        let (name, url) = self.checked_name_and_url(&input)?;
        let sealed = self.seal_submitted_token(input.auth_token.as_deref())?;

        if !self
            .db
            .update_receiver(id, &name, &url, sealed.as_deref(), input.status)?
        {
            return Err(Error::ReceiverNotFound(id));
        }
        self.invalidate();
        tracing::info!(
            receiver_id = id,
            receiver_url = %url,
            token_replaced = sealed.is_some(),
            "Receiver updated"
        );

        self.get_by_id(id)?.ok_or(Error::ReceiverNotFound(id))
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let removed = self.db.delete_receiver(id)?;
        if removed {
            self.invalidate();
            tracing::info!(receiver_id = id, "Receiver removed");
        }
        Ok(removed)
    }

    /// Every receiver ordered by id, tokens decrypted.
    pub fn get_all(&self) -> Result<Vec<Receiver>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.config.cache_ttl() {
                return Ok(cached.receivers.clone());
            }
        }

        let receivers: Vec<Receiver> = self
            .db
            .list_receivers()?
            .into_iter()
            .map(|stored| self.open(stored))
            .collect();

        *cache = Some(CachedList {
            loaded_at: Instant::now(),
            receivers: receivers.clone(),
        });
        Ok(receivers)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Receiver>> {
        Ok(self.get_all()?.into_iter().find(|r| r.id == id))
    }

    /// Capture the receivers at `indices` for a queued job.
    ///
    /// Unknown indices and inactive receivers are skipped. Snapshots keep
    /// the sealed token; nothing decrypted is written to the queue.
    pub fn snapshot(&self, indices: &[usize]) -> Result<Vec<ReceiverSnapshot>> {
        let stored = self.db.list_receivers()?;
        let mut snapshots = Vec::with_capacity(indices.len());

        for &index in indices {
            match stored.get(index) {
                Some(receiver) if receiver.status == ReceiverStatus::Active => {
                    snapshots.push(ReceiverSnapshot {
                        id: receiver.id,
                        name: receiver.name.clone(),
                        url: receiver.url.clone(),
                        sealed_token: receiver.sealed_token.clone(),
                    });
                }
                Some(receiver) => {
                    tracing::debug!(index, receiver_id = receiver.id, "Skipping inactive receiver");
                }
                None => {
                    tracing::debug!(index, "Ignoring unknown receiver index");
                }
            }
        }

        Ok(snapshots)
    }

    /// Turn a queued snapshot back into a dispatchable receiver.
    pub fn resolve(&self, snapshot: &ReceiverSnapshot) -> Receiver {
        let now = chrono::Utc::now();
        Receiver {
            id: snapshot.id,
            name: snapshot.name.clone(),
            url: snapshot.url.clone(),
            auth_token: snapshot
                .sealed_token
                .as_deref()
                .and_then(|sealed| self.vault.decrypt(sealed)),
            status: ReceiverStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Drop the cached receiver list.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn open(&self, stored: StoredReceiver) -> Receiver {
        let auth_token = stored
            .sealed_token
            .as_deref()
            .and_then(|sealed| self.vault.decrypt(sealed));
        if stored.sealed_token.is_some() && auth_token.is_none() {
            tracing::warn!(
                receiver_id = stored.id,
                "Stored token could not be decrypted; requests will be unauthenticated"
            );
        }

        Receiver {
            id: stored.id,
            name: stored.name,
            url: stored.url,
            auth_token,
            status: stored.status,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }

    fn checked_name_and_url(&self, input: &ReceiverInput) -> Result<(String, String)> {
        let parsed = validation::validate_receiver_url(&input.url, self.config.allow_http)?;

        let name = match input.name.trim() {
            "" => parsed.host_str().unwrap_or_default().to_string(),
            name => name.to_string(),
        };

        Ok((name, input.url.trim().to_string()))
    }

    fn seal_submitted_token(&self, token: Option<&str>) -> Result<Option<String>> {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => {
                validation::validate_auth_token(token)?;
                Ok(Some(self.vault.encrypt(token)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<Database>, ReceiverRegistry) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let registry = ReceiverRegistry::new(
            Arc::clone(&db),
            Vault::with_secret("test-secret"),
            ReceiversConfig::default(),
        );
        (db, registry)
    }

    fn input(url: &str, token: Option<&str>) -> ReceiverInput {
        ReceiverInput {
            name: "Receiver".to_string(),
            url: url.to_string(),
            auth_token: token.map(str::to_string),
            status: ReceiverStatus::Active,
        }
    }

    #[test]
    fn test_add_encrypts_token_at_rest() {
        let (db, registry) = registry();
        let receiver = registry
            .add(input("https://a.example/", Some("token-0123456789")))
            .unwrap();
        assert_eq!(receiver.auth_token.as_deref(), Some("token-0123456789"));

        let stored = db.get_receiver(receiver.id).unwrap().unwrap();
        let sealed = stored.sealed_token.unwrap();
        assert_ne!(sealed, "token-0123456789");
    }

    #[test]
    fn test_invalid_receivers_are_never_stored() {
        let (db, registry) = registry();
        for url in ["http://127.0.0.1/x", "http://localhost/x", "http://10.0.0.5/x", "nope"] {
            let err = registry.add(input(url, None)).unwrap_err();
            assert!(matches!(err, Error::InvalidReceiver(_)));
        }
        let err = registry
            .add(input("https://a.example/", Some("short")))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReceiver(_)));

        assert!(db.list_receivers().unwrap().is_empty());
    }

    #[test]
    fn test_resave_without_token_preserves_ciphertext() {
        let (db, registry) = registry();
        let receiver = registry
            .add(input("https://a.example/", Some("token-0123456789")))
            .unwrap();
        let before = db.get_receiver(receiver.id).unwrap().unwrap().sealed_token;

        for submitted in [None, Some("")] {
            let mut edit = input("https://b.example/", submitted);
            edit.name = "Renamed".to_string();
            let updated = registry.update(receiver.id, edit).unwrap();
            assert_eq!(updated.name, "Renamed");
            assert_eq!(updated.auth_token.as_deref(), Some("token-0123456789"));
        }

        let after = db.get_receiver(receiver.id).unwrap().unwrap().sealed_token;
        assert_eq!(before, after);
    }

    #[test]
    fn test_update_with_new_token_replaces_it() {
        let (_db, registry) = registry();
        let receiver = registry
            .add(input("https://a.example/", Some("token-0123456789")))
            .unwrap();
        let updated = registry
            .update(receiver.id, input("https://a.example/", Some("token-abcdefghij")))
            .unwrap();
        assert_eq!(updated.auth_token.as_deref(), Some("token-abcdefghij"));
    }

    #[test]
    fn test_update_missing_receiver() {
        let (_db, registry) = registry();
        let err = registry.update(5, input("https://a.example/", None)).unwrap_err();
        assert!(matches!(err, Error::ReceiverNotFound(5)));
    }

    #[test]
    fn test_blank_name_defaults_to_host() {
        let (_db, registry) = registry();
        let mut submitted = input("https://news.example.org/blog", None);
        submitted.name = "  ".to_string();
        let receiver = registry.add(submitted).unwrap();
        assert_eq!(receiver.name, "news.example.org");
    }

    #[test]
    fn test_cache_is_invalidated_by_writes() {
        let (_db, registry) = registry();
        assert!(registry.get_all().unwrap().is_empty());

        let a = registry.add(input("https://a.example/", None)).unwrap();
        assert_eq!(registry.get_all().unwrap().len(), 1);

        registry.add(input("https://b.example/", None)).unwrap();
        assert_eq!(registry.get_all().unwrap().len(), 2);

        assert!(registry.remove(a.id).unwrap());
        let remaining = registry.get_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url, "https://b.example/");
    }

    #[test]
    fn test_cache_hides_direct_table_writes_until_invalidated() {
        let (db, registry) = registry();
        registry.add(input("https://a.example/", None)).unwrap();
        assert_eq!(registry.get_all().unwrap().len(), 1);

        db.insert_receiver("side", "https://c.example/", None, ReceiverStatus::Active)
            .unwrap();
        assert_eq!(registry.get_all().unwrap().len(), 1);

        registry.invalidate();
        assert_eq!(registry.get_all().unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_selects_by_index_and_keeps_ciphertext() {
        let (db, registry) = registry();
        let first = registry
            .add(input("https://a.example/", Some("token-0123456789")))
            .unwrap();
        let mut off = input("https://b.example/", None);
        off.status = ReceiverStatus::Inactive;
        registry.add(off).unwrap();
        let third = registry.add(input("https://c.example/", None)).unwrap();

        let snapshots = registry.snapshot(&[2, 1, 0, 9]).unwrap();
        let ids: Vec<i64> = snapshots.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![third.id, first.id]);

        let sealed = db.get_receiver(first.id).unwrap().unwrap().sealed_token;
        assert_eq!(snapshots[1].sealed_token, sealed);

        let resolved = registry.resolve(&snapshots[1]);
        assert_eq!(resolved.auth_token.as_deref(), Some("token-0123456789"));
        assert_eq!(registry.resolve(&snapshots[0]).auth_token, None);
    }
}
