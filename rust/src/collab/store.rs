use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::errors::StoreError;
use super::model::{Change, Draft, DraftId};

/// Durable owner of Draft, Segment and RingState records.
///
/// The core validates every change before calling `commit`; the service
/// only has to persist it. A `commit` that returns `Ok` must be durable:
/// events are emitted right after it.
#[async_trait]
pub trait MutationService: Send + Sync + 'static {
    async fn create(&self, draft: Draft) -> Result<(), StoreError>;

    async fn load(&self, id: &DraftId) -> Result<Option<Draft>, StoreError>;

    async fn commit(&self, id: &DraftId, change: &Change) -> Result<(), StoreError>;
}

/// In-process mutation service backing the standalone server and tests.
#[derive(Default)]
pub struct MemoryStore {
    drafts: DashMap<DraftId, Draft>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

#[async_trait]
impl MutationService for MemoryStore {
    async fn create(&self, draft: Draft) -> Result<(), StoreError> {
        match self.drafts.entry(draft.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(draft);
                Ok(())
            }
        }
    }

    async fn load(&self, id: &DraftId) -> Result<Option<Draft>, StoreError> {
        Ok(self.drafts.get(id).map(|d| d.value().clone()))
    }

    async fn commit(&self, id: &DraftId, change: &Change) -> Result<(), StoreError> {
        let mut draft = self.drafts.get_mut(id).ok_or(StoreError::NotFound)?;
        draft.apply(change);
        Ok(())
    }
}
