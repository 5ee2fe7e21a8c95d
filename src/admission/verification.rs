use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use crate::models::TicketData;
use crate::store::{StoreError, TicketStore};

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("no ticket matches '{0}'")]
    NotFound(String),

    #[error("ticket '{0}' has no parent purchase")]
    Orphaned(String),

    #[error("ticket lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Read-only view of a scanned identifier. Never locks and never writes.
#[derive(Clone)]
pub struct VerificationProcedure {
    store: Arc<dyn TicketStore>,
}

impl VerificationProcedure {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    pub async fn verify(&self, identifier: &str) -> Result<TicketData, VerificationError> {
        let unit = self
            .store
            .find_unit(identifier)
            .await?
            .ok_or_else(|| VerificationError::NotFound(identifier.to_string()))?;

        let Some(details) = self.store.purchase_details(unit.purchase_id()).await? else {
            error!(
                identifier,
                purchase_id = %unit.purchase_id(),
                "Redeemable unit references a missing purchase"
            );
            return Err(VerificationError::Orphaned(identifier.to_string()));
        };

        Ok(TicketData::project(&details, &unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnitState;
    use crate::store::memory::{MemoryTicketStore, Seed};

    #[tokio::test]
    async fn test_verify_projects_purchase_and_counters() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let code = seed.legacy_purchase(&store, 3).await;
        let verification = VerificationProcedure::new(store.clone());

        let data = verification.verify(&code).await.unwrap();

        assert_eq!(data.purchase_code, code);
        assert_eq!(data.event_title, seed.event.title);
        assert_eq!(data.ticket_type, "General Admission");
        assert_eq!(
            data.state,
            UnitState::Counter {
                use_count: 0,
                total_quantity: 3
            }
        );
        assert_eq!(data.remaining_tickets, None);
    }

    #[tokio::test]
    async fn test_repeated_verification_leaves_state_alone() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let code = seed.legacy_purchase(&store, 2).await;
        let verification = VerificationProcedure::new(store.clone());

        let first = verification.verify(&code).await.unwrap();
        for _ in 0..10 {
            assert_eq!(verification.verify(&code).await.unwrap(), first);
        }
        assert!(store.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_identifier() {
        let store = Arc::new(MemoryTicketStore::new());
        let verification = VerificationProcedure::new(store);

        let err = verification.verify("ORD-UNKNOWN").await.unwrap_err();

        assert!(matches!(err, VerificationError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_orphaned_unit() {
        let store = Arc::new(MemoryTicketStore::new());
        store.insert_orphaned_legacy("ORD-LOST", 1).await;
        let verification = VerificationProcedure::new(store);

        let err = verification.verify("ORD-LOST").await.unwrap_err();

        assert!(matches!(err, VerificationError::Orphaned(id) if id == "ORD-LOST"));
    }
}
