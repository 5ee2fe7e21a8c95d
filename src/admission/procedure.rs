//! The only write path for ticket redemption.
//!
//! Every store runs [`AdmissionPolicy::apply`] while it holds an exclusive
//! lock on the unit, so the read of the counters and the write that consumes
//! them can never interleave with another scan of the same identifier.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::{ConsumedRow, RedeemableUnit, UnitState};
use crate::store::{StoreError, TicketStore};

/// What a locked evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    AlreadyUsed,
    DuplicateScan,
}

/// Result of one admission attempt. Carries the counters as committed under
/// the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Success { state: UnitState },
    AlreadyUsed { state: UnitState },
    DuplicateScan { state: UnitState },
    NotFound,
}

impl AdmissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionOutcome::Success { .. } => "SUCCESS",
            AdmissionOutcome::AlreadyUsed { .. } => "ALREADY_USED",
            AdmissionOutcome::DuplicateScan { .. } => "DUPLICATE_SCAN",
            AdmissionOutcome::NotFound => "NOT_FOUND",
        }
    }

    pub fn state(&self) -> Option<UnitState> {
        match self {
            AdmissionOutcome::Success { state }
            | AdmissionOutcome::AlreadyUsed { state }
            | AdmissionOutcome::DuplicateScan { state } => Some(*state),
            AdmissionOutcome::NotFound => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AdmissionOutcome::Success { .. })
    }
}

/// A scan to be applied, with the instant it is decided at.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionAttempt<'a> {
    pub identifier: &'a str,
    pub verified_by: &'a str,
    pub at: DateTime<Utc>,
}

/// The redemption rule.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    /// A second scan of an identifier admitted less than this long ago is a
    /// duplicate, not a new admission. Zero disables the check.
    pub duplicate_window: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::seconds(5),
        }
    }
}

impl AdmissionPolicy {
    pub fn new(duplicate_window: Duration) -> Self {
        Self { duplicate_window }
    }

    /// Decides against counters read under the lock.
    pub fn evaluate(&self, unit: &RedeemableUnit, at: DateTime<Utc>) -> Verdict {
        if self.duplicate_window > Duration::zero() {
            if let Some(last) = unit.last_admitted_at() {
                // A last admission stamped after `at` came from a peer with a
                // faster clock and counts as immediate.
                if at.signed_duration_since(last) < self.duplicate_window {
                    return Verdict::DuplicateScan;
                }
            }
        }

        if unit.used() < unit.capacity() {
            Verdict::Admit
        } else {
            Verdict::AlreadyUsed
        }
    }

    /// Evaluates and, when admitting, consumes one admission on the locked
    /// unit. The caller persists the returned row before committing.
    pub fn apply(
        &self,
        unit: &mut RedeemableUnit,
        attempt: &AdmissionAttempt<'_>,
    ) -> (AdmissionOutcome, Option<ConsumedRow>) {
        match self.evaluate(unit, attempt.at) {
            Verdict::DuplicateScan => (
                AdmissionOutcome::DuplicateScan {
                    state: unit.state(),
                },
                None,
            ),
            Verdict::AlreadyUsed => (
                AdmissionOutcome::AlreadyUsed {
                    state: unit.state(),
                },
                None,
            ),
            Verdict::Admit => match unit.consume(attempt.at, attempt.verified_by) {
                Some(row) => (
                    AdmissionOutcome::Success {
                        state: unit.state(),
                    },
                    Some(row),
                ),
                None => (
                    AdmissionOutcome::AlreadyUsed {
                        state: unit.state(),
                    },
                    None,
                ),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("ticket '{0}' has no parent purchase")]
    Orphaned(String),

    #[error("admission write failed: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AdmissionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrphanedTicket(identifier) => AdmissionError::Orphaned(identifier),
            other => AdmissionError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionProcedure {
    store: Arc<dyn TicketStore>,
    policy: AdmissionPolicy,
}

impl AdmissionProcedure {
    pub fn new(store: Arc<dyn TicketStore>, policy: AdmissionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub async fn admit(
        &self,
        identifier: &str,
        verified_by: &str,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        self.admit_at(identifier, verified_by, Utc::now()).await
    }

    /// Same as [`admit`](Self::admit) with an explicit decision time.
    pub async fn admit_at(
        &self,
        identifier: &str,
        verified_by: &str,
        at: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        let attempt = AdmissionAttempt {
            identifier,
            verified_by,
            at,
        };

        let outcome = self
            .store
            .admit(&attempt, &self.policy)
            .await
            .map_err(|e| {
                let e = AdmissionError::from(e);
                match &e {
                    AdmissionError::Orphaned(_) => {
                        error!(identifier, verified_by, "Ticket has no parent purchase")
                    }
                    AdmissionError::Store(inner) => {
                        error!(identifier, verified_by, error = %inner, "Admission write failed")
                    }
                }
                e
            })?;

        match &outcome {
            AdmissionOutcome::Success { state } => info!(
                identifier,
                verified_by,
                remaining = state.remaining(),
                "Ticket admitted"
            ),
            AdmissionOutcome::AlreadyUsed { .. } => {
                info!(identifier, verified_by, "Ticket already used")
            }
            AdmissionOutcome::DuplicateScan { .. } => {
                warn!(identifier, verified_by, "Duplicate scan inside protection window")
            }
            AdmissionOutcome::NotFound => debug!(identifier, "No ticket for identifier"),
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryTicketStore, Seed};

    fn procedure(store: Arc<MemoryTicketStore>, window_secs: i64) -> AdmissionProcedure {
        AdmissionProcedure::new(store, AdmissionPolicy::new(Duration::seconds(window_secs)))
    }

    #[tokio::test]
    async fn test_legacy_four_admissions_then_already_used() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let code = seed.legacy_purchase(&store, 4).await;
        let procedure = procedure(store.clone(), 5);

        let start = Utc::now();
        for i in 0..4 {
            let at = start + Duration::seconds(10 * i);
            let outcome = procedure.admit_at(&code, "gate-a", at).await.unwrap();
            assert!(outcome.is_success(), "admission {i} should succeed");
            assert_eq!(outcome.state().unwrap().remaining(), 3 - i as i32);
        }

        let fifth = procedure
            .admit_at(&code, "gate-a", start + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(
            fifth,
            AdmissionOutcome::AlreadyUsed {
                state: UnitState::Counter {
                    use_count: 4,
                    total_quantity: 4
                }
            }
        );
    }

    #[tokio::test]
    async fn test_rescan_inside_window_is_duplicate() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let code = seed.legacy_purchase(&store, 2).await;
        let procedure = procedure(store.clone(), 5);
        let at = Utc::now();

        assert!(procedure.admit_at(&code, "gate-a", at).await.unwrap().is_success());
        let again = procedure
            .admit_at(&code, "gate-b", at + Duration::seconds(2))
            .await
            .unwrap();

        assert_eq!(again.as_str(), "DUPLICATE_SCAN");
        assert_eq!(again.state().unwrap().remaining(), 1);
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_not_found_and_writes_nothing() {
        let store = Arc::new(MemoryTicketStore::new());
        let procedure = procedure(store.clone(), 5);

        let outcome = procedure.admit("NOPE-123", "gate-a").await.unwrap();

        assert_eq!(outcome, AdmissionOutcome::NotFound);
        assert!(store.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_legacy_ticket_is_reported() {
        let store = Arc::new(MemoryTicketStore::new());
        store.insert_orphaned_legacy("ORPHAN-1", 2).await;
        let procedure = procedure(store.clone(), 5);

        let err = procedure.admit("ORPHAN-1", "gate-a").await.unwrap_err();

        assert!(matches!(err, AdmissionError::Orphaned(id) if id == "ORPHAN-1"));
    }

    #[test]
    fn test_zero_window_never_flags_duplicates() {
        let policy = AdmissionPolicy::new(Duration::zero());
        let unit = RedeemableUnit::LegacyAggregate(crate::models::LegacyTicket {
            purchase_code: "ORD-9".to_string(),
            purchase_id: uuid::Uuid::new_v4(),
            use_count: 1,
            total_quantity: 3,
            last_admitted_at: Some(Utc::now()),
        });

        assert_eq!(policy.evaluate(&unit, Utc::now()), Verdict::Admit);
    }

    #[test]
    fn test_exhausted_unit_outside_window_is_already_used() {
        let policy = AdmissionPolicy::default();
        let used_at = Utc::now() - Duration::minutes(10);
        let mut unit = RedeemableUnit::IndividualUnit(crate::models::IndividualTicket {
            ticket_code: "TKT-1".to_string(),
            purchase_id: uuid::Uuid::new_v4(),
            ordinal: 1,
            is_used: true,
            used_at: Some(used_at),
            used_by: Some("gate-a".to_string()),
            admitted_via: Some("TKT-1".to_string()),
        });
        let attempt = AdmissionAttempt {
            identifier: "TKT-1",
            verified_by: "gate-b",
            at: Utc::now(),
        };

        let (outcome, row) = policy.apply(&mut unit, &attempt);

        assert_eq!(outcome.as_str(), "ALREADY_USED");
        assert!(row.is_none());
        assert_eq!(unit.last_admitted_at(), Some(used_at));
    }
}
