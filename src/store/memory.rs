//! In-process store for tests and local demos.
//!
//! A single async mutex stands in for row locks: every admission runs its
//! lock, evaluate and write steps while holding it.

use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AuditEntry, GeneratedBatch, StoreError, TicketStore};
use crate::admission::procedure::{AdmissionAttempt, AdmissionOutcome, AdmissionPolicy};
use crate::models::{
    ConsumedRow, Event, IndividualTicket, LegacyTicket, Purchase, PurchaseDetails,
    RedeemableUnit, TicketType, UnitFormat,
};

#[derive(Default)]
struct MemoryState {
    events: HashMap<Uuid, Event>,
    ticket_types: HashMap<Uuid, TicketType>,
    purchases: HashMap<Uuid, Purchase>,
    purchase_codes: HashMap<String, Uuid>,
    legacy: HashMap<String, LegacyTicket>,
    individual: HashMap<String, IndividualTicket>,
    batches: HashMap<Uuid, Vec<String>>,
    audit: Vec<AuditEntry>,
}

impl MemoryState {
    fn resolve(&self, identifier: &str) -> Option<RedeemableUnit> {
        if let Some(ticket) = self.individual.get(identifier) {
            return Some(RedeemableUnit::IndividualUnit(ticket.clone()));
        }
        if let Some(ticket) = self.legacy.get(identifier) {
            return Some(RedeemableUnit::LegacyAggregate(ticket.clone()));
        }
        let purchase = self
            .purchase_codes
            .get(identifier)
            .and_then(|id| self.purchases.get(id))
            .filter(|p| p.unit_format == UnitFormat::Individual)?;
        Some(RedeemableUnit::IndividualSet {
            purchase_id: purchase.id,
            purchase_code: purchase.purchase_code.clone(),
            tickets: self.tickets_for(purchase.id),
        })
    }

    fn tickets_for(&self, purchase_id: Uuid) -> Vec<IndividualTicket> {
        self.batches
            .get(&purchase_id)
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(|code| self.individual.get(code).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write_back(&mut self, unit: &RedeemableUnit, row: &ConsumedRow) -> Result<(), StoreError> {
        match (unit, row) {
            (RedeemableUnit::LegacyAggregate(ticket), ConsumedRow::Legacy { purchase_code }) => {
                self.legacy.insert(purchase_code.clone(), ticket.clone());
            }
            (RedeemableUnit::IndividualUnit(ticket), ConsumedRow::Individual { .. }) => {
                self.individual
                    .insert(ticket.ticket_code.clone(), ticket.clone());
            }
            (RedeemableUnit::IndividualSet { tickets, .. }, ConsumedRow::Individual { ticket_code }) => {
                let ticket = tickets
                    .iter()
                    .find(|t| &t.ticket_code == ticket_code)
                    .ok_or_else(|| StoreError::LostUpdate(ticket_code.clone()))?;
                self.individual.insert(ticket_code.clone(), ticket.clone());
            }
            (unit, _) => return Err(StoreError::LostUpdate(unit.identifier().to_string())),
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTicketStore {
    state: Mutex<MemoryState>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, event: Event) {
        self.state.lock().await.events.insert(event.id, event);
    }

    pub async fn insert_ticket_type(&self, ticket_type: TicketType) {
        self.state
            .lock()
            .await
            .ticket_types
            .insert(ticket_type.id, ticket_type);
    }

    /// Adds an aggregate unit whose purchase row does not exist, as found in
    /// some imported data.
    pub async fn insert_orphaned_legacy(&self, purchase_code: &str, total_quantity: i32) {
        let ticket = LegacyTicket {
            purchase_code: purchase_code.to_string(),
            purchase_id: Uuid::new_v4(),
            use_count: 0,
            total_quantity,
            last_admitted_at: None,
        };
        self.state
            .lock()
            .await
            .legacy
            .insert(purchase_code.to_string(), ticket);
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn find_unit(&self, identifier: &str) -> Result<Option<RedeemableUnit>, StoreError> {
        Ok(self.state.lock().await.resolve(identifier))
    }

    async fn purchase_details(
        &self,
        purchase_id: Uuid,
    ) -> Result<Option<PurchaseDetails>, StoreError> {
        let state = self.state.lock().await;
        let Some(purchase) = state.purchases.get(&purchase_id) else {
            return Ok(None);
        };
        let event = state
            .events
            .get(&purchase.event_id)
            .ok_or_else(|| StoreError::Corrupt(format!("event {} missing", purchase.event_id)))?;
        let ticket_type = state.ticket_types.get(&purchase.ticket_type_id).ok_or_else(|| {
            StoreError::Corrupt(format!("ticket type {} missing", purchase.ticket_type_id))
        })?;
        Ok(Some(PurchaseDetails {
            purchase: purchase.clone(),
            event: event.clone(),
            ticket_type: ticket_type.clone(),
        }))
    }

    async fn find_purchase_by_code(
        &self,
        purchase_code: &str,
    ) -> Result<Option<Purchase>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .purchase_codes
            .get(purchase_code)
            .and_then(|id| state.purchases.get(id))
            .cloned())
    }

    async fn ticket_type(&self, id: Uuid) -> Result<Option<TicketType>, StoreError> {
        Ok(self.state.lock().await.ticket_types.get(&id).cloned())
    }

    async fn insert_purchase(
        &self,
        purchase: &Purchase,
        legacy: Option<&LegacyTicket>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.purchase_codes.contains_key(&purchase.purchase_code) {
            return Err(StoreError::DuplicatePurchaseCode(
                purchase.purchase_code.clone(),
            ));
        }
        state
            .purchase_codes
            .insert(purchase.purchase_code.clone(), purchase.id);
        state.purchases.insert(purchase.id, purchase.clone());
        if let Some(ticket) = legacy {
            state
                .legacy
                .insert(ticket.purchase_code.clone(), ticket.clone());
        }
        Ok(())
    }

    async fn admit(
        &self,
        attempt: &AdmissionAttempt<'_>,
        policy: &AdmissionPolicy,
    ) -> Result<AdmissionOutcome, StoreError> {
        let mut state = self.state.lock().await;

        let Some(mut unit) = state.resolve(attempt.identifier) else {
            return Ok(AdmissionOutcome::NotFound);
        };
        if !state.purchases.contains_key(&unit.purchase_id()) {
            return Err(StoreError::OrphanedTicket(attempt.identifier.to_string()));
        }

        let (outcome, row) = policy.apply(&mut unit, attempt);
        if let Some(row) = &row {
            state.write_back(&unit, row)?;
        }

        state.audit.push(AuditEntry {
            identifier: attempt.identifier.to_string(),
            verified_by: attempt.verified_by.to_string(),
            outcome: outcome.as_str(),
            remaining: unit.remaining(),
            at: attempt.at,
        });

        Ok(outcome)
    }

    async fn create_individual_tickets(
        &self,
        purchase_id: Uuid,
        codes: &[String],
    ) -> Result<GeneratedBatch, StoreError> {
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&purchase_id) {
            return Ok(GeneratedBatch {
                tickets: state.tickets_for(purchase_id),
                created: false,
            });
        }
        if let Some(taken) = codes.iter().find(|c| state.individual.contains_key(*c)) {
            return Err(StoreError::Corrupt(format!(
                "ticket code {taken} already issued"
            )));
        }

        let tickets: Vec<IndividualTicket> = codes
            .iter()
            .enumerate()
            .map(|(i, code)| IndividualTicket {
                ticket_code: code.clone(),
                purchase_id,
                ordinal: i as i32 + 1,
                is_used: false,
                used_at: None,
                used_by: None,
                admitted_via: None,
            })
            .collect();
        for ticket in &tickets {
            state
                .individual
                .insert(ticket.ticket_code.clone(), ticket.clone());
        }
        state.batches.insert(purchase_id, codes.to_vec());

        Ok(GeneratedBatch {
            tickets,
            created: true,
        })
    }

    async fn individual_tickets(
        &self,
        purchase_id: Uuid,
    ) -> Result<Vec<IndividualTicket>, StoreError> {
        Ok(self.state.lock().await.tickets_for(purchase_id))
    }
}

/// Catalog fixtures shared by the test modules.
#[cfg(test)]
pub(crate) struct Seed {
    pub event: Event,
    pub single: TicketType,
    pub bundle: TicketType,
}

#[cfg(test)]
impl Seed {
    pub async fn new(store: &MemoryTicketStore) -> Self {
        let now = chrono::Utc::now();
        let event = Event {
            id: Uuid::new_v4(),
            title: "Harbour Lights Festival".to_string(),
            date_text: "Sat 14 September".to_string(),
            time_text: "19:30".to_string(),
            venue: "Pier 4".to_string(),
            created_at: now,
        };
        let single = TicketType {
            id: Uuid::new_v4(),
            event_id: event.id,
            name: "General Admission".to_string(),
            admissions_per_unit: 1,
            created_at: now,
        };
        let bundle = TicketType {
            id: Uuid::new_v4(),
            event_id: event.id,
            name: "Family Pass".to_string(),
            admissions_per_unit: 4,
            created_at: now,
        };
        store.insert_event(event.clone()).await;
        store.insert_ticket_type(single.clone()).await;
        store.insert_ticket_type(bundle.clone()).await;
        Self {
            event,
            single,
            bundle,
        }
    }

    fn purchase(&self, ticket_type: &TicketType, quantity: i32, format: UnitFormat) -> Purchase {
        let id = Uuid::new_v4();
        Purchase {
            id,
            purchase_code: format!("ORD-{}", &id.simple().to_string()[..8]).to_uppercase(),
            customer_name: "Ada Quayle".to_string(),
            customer_email: "ada@example.com".to_string(),
            customer_phone: Some("+44 7700 900123".to_string()),
            event_id: self.event.id,
            ticket_type_id: ticket_type.id,
            quantity,
            price: rust_decimal::Decimal::new(4500, 2),
            currency: "GBP".to_string(),
            unit_format: format,
            purchased_at: chrono::Utc::now(),
        }
    }

    /// A legacy purchase of `quantity` single tickets. Returns its code.
    pub async fn legacy_purchase(&self, store: &MemoryTicketStore, quantity: i32) -> String {
        let purchase = self.purchase(&self.single, quantity, UnitFormat::LegacyAggregate);
        let ticket = LegacyTicket {
            purchase_code: purchase.purchase_code.clone(),
            purchase_id: purchase.id,
            use_count: 0,
            total_quantity: quantity,
            last_admitted_at: None,
        };
        store
            .insert_purchase(&purchase, Some(&ticket))
            .await
            .expect("seed legacy purchase");
        purchase.purchase_code
    }

    /// An individual-format purchase of `quantity` bundles, not yet generated.
    pub async fn individual_purchase(&self, store: &MemoryTicketStore, quantity: i32) -> Purchase {
        let purchase = self.purchase(&self.bundle, quantity, UnitFormat::Individual);
        store
            .insert_purchase(&purchase, None)
            .await
            .expect("seed individual purchase");
        purchase
    }
}

/// Memory store whose detail reads time out once an admission commits.
#[cfg(test)]
pub(crate) struct FlakyDetailsStore {
    inner: Arc<MemoryTicketStore>,
    admitted: AtomicBool,
}

#[cfg(test)]
impl FlakyDetailsStore {
    pub(crate) fn new(inner: Arc<MemoryTicketStore>) -> Self {
        Self {
            inner,
            admitted: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl TicketStore for FlakyDetailsStore {
    async fn find_unit(&self, identifier: &str) -> Result<Option<RedeemableUnit>, StoreError> {
        self.inner.find_unit(identifier).await
    }

    async fn purchase_details(
        &self,
        purchase_id: Uuid,
    ) -> Result<Option<PurchaseDetails>, StoreError> {
        if self.admitted.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.purchase_details(purchase_id).await
    }

    async fn find_purchase_by_code(
        &self,
        purchase_code: &str,
    ) -> Result<Option<Purchase>, StoreError> {
        self.inner.find_purchase_by_code(purchase_code).await
    }

    async fn ticket_type(&self, id: Uuid) -> Result<Option<TicketType>, StoreError> {
        self.inner.ticket_type(id).await
    }

    async fn insert_purchase(
        &self,
        purchase: &Purchase,
        legacy: Option<&LegacyTicket>,
    ) -> Result<(), StoreError> {
        self.inner.insert_purchase(purchase, legacy).await
    }

    async fn admit(
        &self,
        attempt: &AdmissionAttempt<'_>,
        policy: &AdmissionPolicy,
    ) -> Result<AdmissionOutcome, StoreError> {
        let outcome = self.inner.admit(attempt, policy).await?;
        if outcome.is_success() {
            self.admitted.store(true, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn create_individual_tickets(
        &self,
        purchase_id: Uuid,
        codes: &[String],
    ) -> Result<GeneratedBatch, StoreError> {
        self.inner.create_individual_tickets(purchase_id, codes).await
    }

    async fn individual_tickets(
        &self,
        purchase_id: Uuid,
    ) -> Result<Vec<IndividualTicket>, StoreError> {
        self.inner.individual_tickets(purchase_id).await
    }
}
