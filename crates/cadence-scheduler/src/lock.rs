//! Lock providers: the only arbiter of "who may run this job right now".
//!
//! The in-process providers here cover single-host deployments and tests.
//! A distributed provider implements the same trait.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// `Ok(None)` means the lock is held elsewhere.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>>;
}

/// An acquired lock. Released exactly once: by [`LockHandle::release`] or
/// when dropped, whichever comes first.
pub struct LockHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle that guards nothing.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("held", &self.release.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Grants every request. Only correct when a single host runs the jobs.
#[derive(Debug, Default, Clone)]
pub struct NoopLockProvider;

#[async_trait]
impl LockProvider for NoopLockProvider {
    async fn try_acquire(&self, _name: &str) -> Result<Option<LockHandle>> {
        Ok(Some(LockHandle::noop()))
    }
}

/// One lock for the whole process: at most one job executes at a time,
/// whatever its name.
#[derive(Debug, Default, Clone)]
pub struct SingletonLockProvider {
    held: Arc<AtomicBool>,
}

impl SingletonLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LockProvider for SingletonLockProvider {
    async fn try_acquire(&self, _name: &str) -> Result<Option<LockHandle>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let held = self.held.clone();
        Ok(Some(LockHandle::new(move || {
            held.store(false, Ordering::Release)
        })))
    }
}

/// One lock per name.
#[derive(Debug, Default, Clone)]
pub struct NamedLockProvider {
    held: Arc<DashMap<String, Uuid>>,
}

impl NamedLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }
}

#[async_trait]
impl LockProvider for NamedLockProvider {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>> {
        let token = Uuid::new_v4();
        match self.held.entry(name.to_string()) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(v) => {
                v.insert(token);
            }
        }
        let held = self.held.clone();
        let name = name.to_string();
        Ok(Some(LockHandle::new(move || {
            held.remove_if(&name, |_, owner| *owner == token);
        })))
    }
}
