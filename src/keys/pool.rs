//! Round-robin credential pool with failure-based invalidation.

use crate::error::{Result, TryOnError};
use crate::keys::store::{CredentialRecord, KeyPoolState, KeyStatus, KeyStore, MemoryKeyStore};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Rotating pool of credentials.
///
/// State lives in the injected [`KeyStore`]; every operation loads it, decides,
/// and saves it while holding the pool lock, so concurrent generations never
/// select from a stale cursor or reuse a credential invalidated a moment ago.
pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool").finish_non_exhaustive()
    }
}

impl KeyPool {
    /// Creates a pool over `store`.
    pub fn new(store: impl KeyStore + 'static) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Creates a pool over a store shared with other owners.
    pub fn from_shared(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Creates an in-memory pool of `Unknown` credentials.
    pub fn in_memory<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MemoryKeyStore::new(KeyPoolState::from_keys(keys)))
    }

    /// Runs `f` on the loaded state as one critical section.
    ///
    /// `f` returns its result and whether the state changed; changed state is saved.
    fn update<T>(&self, f: impl FnOnce(&mut KeyPoolState) -> (T, bool)) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.store.load()?;
        let (out, changed) = f(&mut state);
        if changed {
            self.store.save(&state)?;
        }
        Ok(out)
    }

    /// Selects the next credential that is not `Invalid`.
    ///
    /// Scans forward from the record after the cursor, wrapping around, and
    /// visits each record at most once. The new cursor is persisted before the
    /// record is returned. Fails with [`TryOnError::NoAvailableKey`] when the pool
    /// is empty or every record is invalid.
    pub fn acquire_next(&self) -> Result<CredentialRecord> {
        let picked = self.update(|state| {
            let len = state.records.len();
            if len == 0 {
                return (None, false);
            }
            let start = state.cursor.map_or(0, |c| (c % len + 1) % len);
            let found = (0..len)
                .map(|offset| (start + offset) % len)
                .find(|&idx| state.records[idx].is_usable());
            match found {
                Some(idx) => {
                    state.cursor = Some(idx);
                    (Some(state.records[idx].clone()), true)
                }
                None => (None, false),
            }
        })?;

        match picked {
            Some(record) => {
                tracing::debug!(key = %record.masked(), status = %record.status, "acquired credential");
                Ok(record)
            }
            None => {
                tracing::debug!("no usable credential in pool");
                Err(TryOnError::NoAvailableKey)
            }
        }
    }

    fn set_status(&self, value: &str, status: KeyStatus) -> Result<bool> {
        self.update(|state| match state.position(value) {
            Some(idx) => {
                let changed = state.records[idx].status != status;
                state.records[idx].status = status;
                (true, changed)
            }
            None => (false, false),
        })
    }

    /// Marks `value` as accepted by the back end. No-op if absent.
    pub fn report_valid(&self, value: &str) -> Result<()> {
        self.set_status(value, KeyStatus::Valid)?;
        Ok(())
    }

    /// Marks `value` as rejected by the back end. No-op if absent.
    ///
    /// The record is skipped by [`acquire_next`](Self::acquire_next) until
    /// [`reset`](Self::reset) is called for it.
    pub fn report_invalid(&self, value: &str) -> Result<()> {
        if self.set_status(value, KeyStatus::Invalid)? {
            tracing::warn!(key = %crate::keys::mask_key(value), "credential marked invalid");
        }
        Ok(())
    }

    /// Returns true if at least one record is not `Invalid`.
    pub fn has_usable(&self) -> Result<bool> {
        Ok(self
            .snapshot()?
            .records
            .iter()
            .any(CredentialRecord::is_usable))
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> Result<KeyPoolState> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.load()
    }

    /// Appends a credential with `Unknown` status.
    ///
    /// Returns false if the trimmed value is empty or already present.
    pub fn add(&self, value: &str) -> Result<bool> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(false);
        }
        self.update(|state| {
            if state.position(value).is_some() {
                return (false, false);
            }
            state.records.push(CredentialRecord::new(value));
            (true, true)
        })
    }

    /// Removes a credential. Returns false if it was not present.
    ///
    /// The cursor keeps pointing at the same record when that record survives;
    /// it is unset when the removed record was the last one returned.
    pub fn remove(&self, value: &str) -> Result<bool> {
        self.update(|state| {
            let Some(idx) = state.position(value) else {
                return (false, false);
            };
            state.records.remove(idx);
            state.cursor = match state.cursor {
                Some(c) if c == idx => None,
                Some(c) if c > idx => Some(c - 1),
                other => other,
            };
            (true, true)
        })
    }

    /// Returns a credential to `Unknown` status, making it selectable again.
    /// Returns false if it was not present.
    pub fn reset(&self, value: &str) -> Result<bool> {
        self.set_status(value, KeyStatus::Unknown)
    }

    /// Verifies every credential not already `Valid` and records the outcome.
    ///
    /// `verify` runs outside the pool lock. `Ok(true)` marks the credential
    /// valid, `Ok(false)` invalid; an error leaves its status untouched.
    /// Returns the credentials whose status was decided, with the new status.
    pub async fn verify_unconfirmed<F, Fut>(&self, mut verify: F) -> Result<Vec<(String, KeyStatus)>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let pending: Vec<String> = self
            .snapshot()?
            .records
            .into_iter()
            .filter(|r| r.status != KeyStatus::Valid)
            .map(|r| r.value)
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        for value in pending {
            let status = match verify(value.clone()).await {
                Ok(true) => KeyStatus::Valid,
                Ok(false) => KeyStatus::Invalid,
                Err(e) => {
                    tracing::warn!(key = %crate::keys::mask_key(&value), "verification failed: {e}");
                    continue;
                }
            };
            // The key may have been removed while the verifier ran.
            if self.set_status(&value, status)? {
                outcomes.push((value, status));
            }
        }
        Ok(outcomes)
    }
}
