use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::admission::procedure::{AdmissionAttempt, AdmissionOutcome, AdmissionPolicy};
use crate::models::{
    IndividualTicket, LegacyTicket, Purchase, PurchaseDetails, RedeemableUnit, TicketType,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTicketStore;
pub use postgres::PgTicketStore;

/// Postgres error codes worth another try: lock_not_available,
/// serialization_failure, deadlock_detected, query_canceled.
const TRANSIENT_SQLSTATES: &[&str] = &["55P03", "40001", "40P01", "57014"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ticket '{0}' has no parent purchase")]
    OrphanedTicket(String),

    #[error("purchase code '{0}' already exists")]
    DuplicatePurchaseCode(String),

    #[error("row changed under lock: {0}")]
    LostUpdate(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut)
            | StoreError::Database(sqlx::Error::PoolClosed)
            | StoreError::Database(sqlx::Error::Io(_)) => true,
            StoreError::Database(sqlx::Error::Database(db)) => db
                .code()
                .map(|code| TRANSIENT_SQLSTATES.contains(&&*code))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Result of asking the store for a purchase's individual tickets.
#[derive(Debug, Clone)]
pub struct GeneratedBatch {
    pub tickets: Vec<IndividualTicket>,
    /// False when an earlier call had already generated the batch.
    pub created: bool,
}

/// One row of the admission audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub identifier: String,
    pub verified_by: String,
    pub outcome: &'static str,
    pub remaining: i32,
    pub at: DateTime<Utc>,
}

/// Durable home of purchases and redeemable units.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Plain read, never locks.
    async fn find_unit(&self, identifier: &str) -> Result<Option<RedeemableUnit>, StoreError>;

    async fn purchase_details(
        &self,
        purchase_id: Uuid,
    ) -> Result<Option<PurchaseDetails>, StoreError>;

    async fn find_purchase_by_code(
        &self,
        purchase_code: &str,
    ) -> Result<Option<Purchase>, StoreError>;

    async fn ticket_type(&self, id: Uuid) -> Result<Option<TicketType>, StoreError>;

    /// Records a purchase, with its aggregate unit when it uses one.
    async fn insert_purchase(
        &self,
        purchase: &Purchase,
        legacy: Option<&LegacyTicket>,
    ) -> Result<(), StoreError>;

    /// Locks the unit, applies `policy` and commits, all in one transaction.
    async fn admit(
        &self,
        attempt: &AdmissionAttempt<'_>,
        policy: &AdmissionPolicy,
    ) -> Result<AdmissionOutcome, StoreError>;

    /// Stores `codes` as the purchase's individual tickets unless a batch
    /// exists already, in which case the existing one is returned.
    async fn create_individual_tickets(
        &self,
        purchase_id: Uuid,
        codes: &[String],
    ) -> Result<GeneratedBatch, StoreError>;

    async fn individual_tickets(
        &self,
        purchase_id: Uuid,
    ) -> Result<Vec<IndividualTicket>, StoreError>;
}
