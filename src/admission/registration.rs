use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::purchase::{self, MAX_ADMISSIONS_PER_PURCHASE};
use crate::models::{LegacyTicket, NewPurchase, Purchase, UnitFormat};
use crate::store::{StoreError, TicketStore};

const PURCHASE_CODE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("{0}")]
    Invalid(String),

    #[error("ticket type {0} not found")]
    UnknownTicketType(Uuid),

    #[error("purchase could not be stored: {0}")]
    Store(#[from] StoreError),
}

/// Entry point for checkout: records a completed purchase and decides, once,
/// how it will be redeemed.
#[derive(Clone)]
pub struct PurchaseRegistry {
    store: Arc<dyn TicketStore>,
    individual_cutover: DateTime<Utc>,
}

impl PurchaseRegistry {
    pub fn new(store: Arc<dyn TicketStore>, individual_cutover: DateTime<Utc>) -> Self {
        Self {
            store,
            individual_cutover,
        }
    }

    pub async fn register(&self, new: NewPurchase) -> Result<Purchase, RegistrationError> {
        validate(&new)?;

        let ticket_type = self
            .store
            .ticket_type(new.ticket_type_id)
            .await?
            .ok_or(RegistrationError::UnknownTicketType(new.ticket_type_id))?;

        let purchased_at = new.purchased_at.unwrap_or_else(Utc::now);
        let total_admissions =
            purchase::total_admissions(new.quantity, ticket_type.admissions_per_unit).ok_or_else(
                || {
                    RegistrationError::Invalid(format!(
                        "a purchase may carry at most {MAX_ADMISSIONS_PER_PURCHASE} admissions"
                    ))
                },
            )?;
        let unit_format =
            UnitFormat::select(total_admissions, purchased_at, self.individual_cutover);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let purchase = Purchase {
                id: Uuid::new_v4(),
                purchase_code: mint_purchase_code(),
                customer_name: new.customer_name.trim().to_string(),
                customer_email: new.customer_email.trim().to_string(),
                customer_phone: new.customer_phone.clone(),
                event_id: ticket_type.event_id,
                ticket_type_id: ticket_type.id,
                quantity: new.quantity,
                price: new.price,
                currency: new.currency.to_uppercase(),
                unit_format,
                purchased_at,
            };
            let legacy = (unit_format == UnitFormat::LegacyAggregate).then(|| LegacyTicket {
                purchase_code: purchase.purchase_code.clone(),
                purchase_id: purchase.id,
                use_count: 0,
                total_quantity: total_admissions,
                last_admitted_at: None,
            });

            match self.store.insert_purchase(&purchase, legacy.as_ref()).await {
                Ok(()) => {
                    info!(
                        purchase_id = %purchase.id,
                        purchase_code = %purchase.purchase_code,
                        unit_format = %unit_format,
                        total_admissions,
                        "Purchase registered"
                    );
                    return Ok(purchase);
                }
                Err(StoreError::DuplicatePurchaseCode(code)) if attempt < PURCHASE_CODE_ATTEMPTS => {
                    warn!(%code, attempt, "Purchase code collision, minting another");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn validate(new: &NewPurchase) -> Result<(), RegistrationError> {
    if new.customer_name.trim().is_empty() {
        return Err(RegistrationError::Invalid("customer_name is required".into()));
    }
    if !new.customer_email.contains('@') {
        return Err(RegistrationError::Invalid("customer_email is not valid".into()));
    }
    if new.quantity < 1 {
        return Err(RegistrationError::Invalid("quantity must be at least 1".into()));
    }
    if new.quantity > MAX_ADMISSIONS_PER_PURCHASE {
        return Err(RegistrationError::Invalid(format!(
            "quantity cannot exceed {MAX_ADMISSIONS_PER_PURCHASE}"
        )));
    }
    if new.price < Decimal::ZERO {
        return Err(RegistrationError::Invalid("price cannot be negative".into()));
    }
    if new.currency.len() != 3 || !new.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RegistrationError::Invalid(
            "currency must be a three-letter code".into(),
        ));
    }
    Ok(())
}

fn mint_purchase_code() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("ORD-{}", &hex[..10])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryTicketStore, Seed};
    use chrono::{Duration, TimeZone};

    fn new_purchase(ticket_type_id: Uuid, quantity: i32, at: DateTime<Utc>) -> NewPurchase {
        NewPurchase {
            customer_name: "Ada Quayle".to_string(),
            customer_email: "ada@example.com".to_string(),
            customer_phone: None,
            ticket_type_id,
            quantity,
            price: Decimal::new(9000, 2),
            currency: "gbp".to_string(),
            purchased_at: Some(at),
        }
    }

    fn cutover() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_legacy_purchase_gets_aggregate_unit() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let registry = PurchaseRegistry::new(store.clone(), cutover());

        let purchase = registry
            .register(new_purchase(seed.single.id, 3, cutover() - Duration::days(1)))
            .await
            .unwrap();

        assert_eq!(purchase.unit_format, UnitFormat::LegacyAggregate);
        assert_eq!(purchase.currency, "GBP");
        let unit = store.find_unit(&purchase.purchase_code).await.unwrap().unwrap();
        assert_eq!(unit.capacity(), 3);
    }

    #[tokio::test]
    async fn test_bundle_after_cutover_is_individual() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let registry = PurchaseRegistry::new(store.clone(), cutover());

        let purchase = registry
            .register(new_purchase(seed.bundle.id, 1, cutover() + Duration::days(1)))
            .await
            .unwrap();

        assert_eq!(purchase.unit_format, UnitFormat::Individual);
        assert!(store.individual_tickets(purchase.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_zero_quantity() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let registry = PurchaseRegistry::new(store, cutover());

        let err = registry
            .register(new_purchase(seed.single.id, 0, cutover()))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistrationError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_rejects_quantity_beyond_admission_limit() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let registry = PurchaseRegistry::new(store.clone(), cutover());
        let at = cutover() + Duration::days(1);

        for quantity in [i32::MAX / 2, 251] {
            let err = registry
                .register(new_purchase(seed.bundle.id, quantity, at))
                .await
                .unwrap_err();
            assert!(matches!(err, RegistrationError::Invalid(_)), "{quantity}: {err:?}");
        }

        let largest = registry
            .register(new_purchase(seed.bundle.id, 250, at))
            .await
            .unwrap();
        assert_eq!(largest.unit_format, UnitFormat::Individual);
    }

    #[tokio::test]
    async fn test_unknown_ticket_type() {
        let store = Arc::new(MemoryTicketStore::new());
        let registry = PurchaseRegistry::new(store, cutover());

        let err = registry
            .register(new_purchase(Uuid::new_v4(), 1, cutover()))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistrationError::UnknownTicketType(_)));
    }
}
