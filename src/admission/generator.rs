use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{IndividualTicket, UnitFormat};
use crate::store::{StoreError, TicketStore};

const TICKET_CODE_PREFIX: &str = "TKT";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("purchase {0} not found")]
    PurchaseNotFound(Uuid),

    #[error("purchase {0} is redeemed through its aggregate ticket")]
    NotIndividual(Uuid),

    #[error("purchase {0} carries more admissions than one purchase may")]
    TooManyAdmissions(Uuid),

    #[error("ticket generation failed: {0}")]
    Store(#[from] StoreError),
}

/// Expands a multi-admission purchase into one ticket per admission.
#[derive(Clone)]
pub struct IndividualTicketGenerator {
    store: Arc<dyn TicketStore>,
}

impl IndividualTicketGenerator {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    /// Returns the purchase's tickets, creating them on the first call.
    pub async fn generate(
        &self,
        purchase_id: Uuid,
    ) -> Result<Vec<IndividualTicket>, GenerationError> {
        let details = self
            .store
            .purchase_details(purchase_id)
            .await?
            .ok_or(GenerationError::PurchaseNotFound(purchase_id))?;
        if details.purchase.unit_format != UnitFormat::Individual {
            return Err(GenerationError::NotIndividual(purchase_id));
        }

        let existing = self.store.individual_tickets(purchase_id).await?;
        if !existing.is_empty() {
            debug!(%purchase_id, count = existing.len(), "Individual tickets already generated");
            return Ok(existing);
        }

        let expected = details
            .total_admissions()
            .ok_or(GenerationError::TooManyAdmissions(purchase_id))?;
        let codes: Vec<String> = (0..expected).map(|_| mint_ticket_code()).collect();
        let batch = self
            .store
            .create_individual_tickets(purchase_id, &codes)
            .await?;

        if batch.tickets.len() != expected as usize {
            warn!(
                %purchase_id,
                expected,
                actual = batch.tickets.len(),
                "Individual ticket count differs from purchase quantity"
            );
        }
        if batch.created {
            info!(%purchase_id, count = batch.tickets.len(), "Generated individual tickets");
        } else {
            debug!(%purchase_id, "Concurrent generation won, reusing its tickets");
        }

        Ok(batch.tickets)
    }

    /// Generates tickets when `identifier` is the code of an individual-format
    /// purchase. Any other identifier is left alone.
    pub async fn ensure_for_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Vec<IndividualTicket>>, GenerationError> {
        match self.store.find_purchase_by_code(identifier).await? {
            Some(purchase) if purchase.unit_format == UnitFormat::Individual => {
                self.generate(purchase.id).await.map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// `TKT-XXXX-XXXX-XXXX-XXXX` from 64 random bits.
pub fn mint_ticket_code() -> String {
    // The top 48 bits of a v4 uuid are random; the version nibble follows.
    let random = |uuid: Uuid| (uuid.as_u128() >> 96) as u64;
    let bits = random(Uuid::new_v4()) << 32 | random(Uuid::new_v4());
    let hex = format!("{bits:016X}");
    let groups: Vec<&str> = (0..4).map(|i| &hex[i * 4..i * 4 + 4]).collect();
    format!("{TICKET_CODE_PREFIX}-{}", groups.join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryTicketStore, Seed};
    use std::collections::HashSet;

    #[test]
    fn test_ticket_code_shape() {
        let code = mint_ticket_code();
        assert_eq!(code.len(), "TKT-".len() + 19);
        assert!(code.starts_with("TKT-"));
        assert_eq!(code.matches('-').count(), 4);
        assert!(code[4..]
            .chars()
            .all(|c| c == '-' || c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_ticket_code_groups_carry_no_fixed_digit() {
        let third_group_leads: HashSet<char> = (0..64)
            .map(|_| mint_ticket_code().chars().nth("TKT-XXXX-XXXX-".len()).unwrap())
            .collect();
        assert!(third_group_leads.len() > 1, "{third_group_leads:?}");
    }

    #[tokio::test]
    async fn test_generates_quantity_times_bundle_size() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let purchase = seed.individual_purchase(&store, 2).await;
        let generator = IndividualTicketGenerator::new(store.clone());

        let tickets = generator.generate(purchase.id).await.unwrap();

        assert_eq!(tickets.len(), 8);
        assert!(tickets.iter().all(|t| !t.is_used && t.purchase_id == purchase.id));
        let ordinals: Vec<i32> = tickets.iter().map(|t| t.ordinal).collect();
        assert_eq!(ordinals, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_second_call_returns_same_codes() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let purchase = seed.individual_purchase(&store, 1).await;
        let generator = IndividualTicketGenerator::new(store.clone());

        let first = generator.generate(purchase.id).await.unwrap();
        let second = generator.generate(purchase.id).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_generation_creates_one_batch() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let purchase = seed.individual_purchase(&store, 3).await;
        let generator = IndividualTicketGenerator::new(store.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = generator.clone();
                tokio::spawn(async move { generator.generate(purchase.id).await.unwrap() })
            })
            .collect();

        let mut batches = Vec::new();
        for handle in handles {
            batches.push(handle.await.unwrap());
        }

        let codes: HashSet<&str> = batches
            .iter()
            .flatten()
            .map(|t| t.ticket_code.as_str())
            .collect();
        assert_eq!(codes.len(), 12);
        assert!(batches.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_legacy_purchase_is_not_expanded() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let code = seed.legacy_purchase(&store, 3).await;
        let purchase = store.find_purchase_by_code(&code).await.unwrap().unwrap();
        let generator = IndividualTicketGenerator::new(store.clone());

        let err = generator.generate(purchase.id).await.unwrap_err();
        assert!(matches!(err, GenerationError::NotIndividual(_)));
        assert!(generator.ensure_for_identifier(&code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_purchase_mints_nothing() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let purchase = seed.individual_purchase(&store, i32::MAX / 2).await;
        let generator = IndividualTicketGenerator::new(store.clone());

        let err = generator.generate(purchase.id).await.unwrap_err();

        assert!(matches!(err, GenerationError::TooManyAdmissions(_)));
        assert!(store.individual_tickets(purchase.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_purchase() {
        let store = Arc::new(MemoryTicketStore::new());
        let generator = IndividualTicketGenerator::new(store);

        let err = generator.generate(Uuid::new_v4()).await.unwrap_err();

        assert!(matches!(err, GenerationError::PurchaseNotFound(_)));
    }
}
