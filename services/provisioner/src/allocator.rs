//! Guest id allocation.

use std::sync::Arc;

use pvx_id::GuestId;
use tracing::debug;

use crate::api::PlatformApi;
use crate::error::EngineError;

/// Where an id came from. Only auto-assigned ids may be retried on collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Explicit(GuestId),
    Auto(GuestId),
}

impl Allocation {
    pub fn vmid(&self) -> GuestId {
        match self {
            Allocation::Explicit(id) | Allocation::Auto(id) => *id,
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Allocation::Auto(_))
    }
}

/// Hands out guest ids.
pub struct IdAllocator {
    api: Arc<dyn PlatformApi>,
}

impl IdAllocator {
    pub fn new(api: Arc<dyn PlatformApi>) -> Self {
        Self { api }
    }

    /// Returns `explicit` unchanged, or the platform's next free id.
    pub async fn allocate(&self, explicit: Option<GuestId>) -> Result<Allocation, EngineError> {
        if let Some(vmid) = explicit {
            return Ok(Allocation::Explicit(vmid));
        }
        let vmid = self
            .api
            .next_id()
            .await
            .map_err(EngineError::api("allocate guest id", None))?;
        debug!(vmid = %vmid, "allocated guest id");
        Ok(Allocation::Auto(vmid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;

    #[tokio::test]
    async fn test_explicit_id_is_not_allocated() {
        let mock = Arc::new(MockPlatform::new());
        let allocator = IdAllocator::new(mock.clone());
        let vmid = GuestId::new(150).unwrap();

        let allocation = allocator.allocate(Some(vmid)).await.unwrap();
        assert_eq!(allocation, Allocation::Explicit(vmid));
        assert_eq!(mock.next_id_calls(), 0);
    }

    #[tokio::test]
    async fn test_auto_id_comes_from_platform() {
        let mock = Arc::new(MockPlatform::new());
        let allocator = IdAllocator::new(mock.clone());

        let allocation = allocator.allocate(None).await.unwrap();
        assert!(allocation.is_auto());
        assert_eq!(allocation.vmid(), GuestId::FIRST);
        assert_eq!(mock.next_id_calls(), 1);
    }
}
