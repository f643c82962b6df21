use super::{Identity, NumericIdentity};
use crate::labels::Labels;
use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Turns label sets into security identities.
///
/// Endpoints with equal label sets must converge on the same identity, and
/// the allocator is responsible for reference counting them.
#[async_trait::async_trait]
pub trait IdentityAllocator: Send + Sync {
    /// Allocates or looks up the identity for `labels`. `hint` is a numeric
    /// identity to prefer when a new one has to be allocated.
    async fn allocate_identity(
        &self,
        labels: &Labels,
        notify_selector_cache: bool,
        hint: Option<NumericIdentity>,
    ) -> Result<(Arc<Identity>, bool)>;

    /// Drops one reference to `identity` and returns true if it was the last.
    async fn release(&self, identity: &Identity, notify_selector_cache: bool) -> Result<bool>;
}

/// A node-local allocator.
///
/// Reserved label sets map onto their well-known identities. All other sets
/// are assigned identities from `[min, max]`, wrapping around once the range
/// is exhausted.
#[derive(Debug)]
pub struct LocalAllocator {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    by_id: HashMap<NumericIdentity, Entry>,
    by_labels: HashMap<String, NumericIdentity>,
    next: u32,
    min: u32,
    max: u32,
}

#[derive(Debug)]
struct Entry {
    identity: Arc<Identity>,
    refs: usize,
}

// === impl LocalAllocator ===

impl Default for LocalAllocator {
    fn default() -> Self {
        Self::new(NumericIdentity::MIN_ALLOCATED.0, u16::MAX as u32)
    }
}

impl LocalAllocator {
    pub fn new(min: u32, max: u32) -> Self {
        let min = min.max(NumericIdentity::MIN_ALLOCATED.0);
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::default(),
                by_labels: HashMap::default(),
                next: min,
                min,
                max: max.max(min),
            }),
        }
    }

    pub fn lookup(&self, labels: &Labels) -> Option<Arc<Identity>> {
        if let Some(id) = Identity::lookup_reserved(labels) {
            return Some(id);
        }
        let inner = self.inner.lock();
        let id = inner.by_labels.get(&labels.sorted_list())?;
        inner.by_id.get(id).map(|e| e.identity.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup_or_create(
        &self,
        labels: &Labels,
        hint: Option<NumericIdentity>,
    ) -> Result<(Arc<Identity>, bool)> {
        let key = labels.sorted_list();
        let mut inner = self.inner.lock();

        if let Some(id) = inner.by_labels.get(&key).copied() {
            if let Some(entry) = inner.by_id.get_mut(&id) {
                entry.refs += 1;
                return Ok((entry.identity.clone(), false));
            }
        }

        let id = inner.next_free(hint)?;
        let identity = Arc::new(Identity::new(id, labels.clone()));
        inner.by_labels.insert(key, id);
        inner.by_id.insert(
            id,
            Entry {
                identity: identity.clone(),
                refs: 1,
            },
        );
        tracing::debug!(identity = %id, %labels, "Allocated local identity");
        Ok((identity, true))
    }
}

#[async_trait::async_trait]
impl IdentityAllocator for LocalAllocator {
    async fn allocate_identity(
        &self,
        labels: &Labels,
        _notify_selector_cache: bool,
        hint: Option<NumericIdentity>,
    ) -> Result<(Arc<Identity>, bool)> {
        if labels.is_empty() {
            bail!("cannot allocate an identity for an empty label set");
        }
        if let Some(id) = Identity::lookup_reserved(labels) {
            return Ok((id, false));
        }
        self.lookup_or_create(labels, hint)
    }

    async fn release(&self, identity: &Identity, _notify_selector_cache: bool) -> Result<bool> {
        if identity.id.is_reserved() {
            return Ok(false);
        }

        let mut inner = self.inner.lock();
        let Some(entry) = inner.by_id.get_mut(&identity.id) else {
            return Ok(false);
        };
        if entry.refs > 1 {
            entry.refs -= 1;
            return Ok(false);
        }

        inner.by_id.remove(&identity.id);
        inner.by_labels.remove(&identity.labels.sorted_list());
        tracing::debug!(identity = %identity.id, "Released local identity");
        Ok(true)
    }
}

// === impl Inner ===

impl Inner {
    fn bump(&mut self) {
        if self.next >= self.max {
            self.next = self.min;
        } else {
            self.next += 1;
        }
    }

    fn next_free(&mut self, hint: Option<NumericIdentity>) -> Result<NumericIdentity> {
        if let Some(hint) = hint {
            if (self.min..=self.max).contains(&hint.0) && !self.by_id.contains_key(&hint) {
                return Ok(hint);
            }
        }

        let first = self.next;
        loop {
            let candidate = NumericIdentity(self.next);
            self.bump();
            if !self.by_id.contains_key(&candidate) {
                return Ok(candidate);
            }
            if self.next == first {
                bail!("out of local identity space");
            }
        }
    }
}
