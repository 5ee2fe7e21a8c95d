//! One request, one answer: generation, admission and verification in the
//! order that keeps the display read behind the write.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use super::generator::{GenerationError, IndividualTicketGenerator};
use super::procedure::{AdmissionError, AdmissionOutcome, AdmissionPolicy, AdmissionProcedure};
use super::verification::{VerificationError, VerificationProcedure};
use crate::models::{AdmissionRequest, AdmissionResponse, TicketData};
use crate::store::{StoreError, TicketStore};
use crate::utils::error::ErrorCode;

const UNATTRIBUTED: &str = "unattributed";

/// Stateless per-scan handler. Cloning is cheap; clones share the store.
#[derive(Clone)]
pub struct AdmissionOrchestrator {
    generator: IndividualTicketGenerator,
    admission: AdmissionProcedure,
    verification: VerificationProcedure,
}

impl AdmissionOrchestrator {
    pub fn new(store: Arc<dyn TicketStore>, policy: AdmissionPolicy) -> Self {
        Self {
            generator: IndividualTicketGenerator::new(store.clone()),
            admission: AdmissionProcedure::new(store.clone(), policy),
            verification: VerificationProcedure::new(store),
        }
    }

    pub fn generator(&self) -> &IndividualTicketGenerator {
        &self.generator
    }

    #[instrument(skip(self, request), fields(identifier = %request.ticket_identifier.trim(), auto_admit = request.auto_admit))]
    pub async fn handle(&self, request: &AdmissionRequest) -> AdmissionResponse {
        let identifier = request.ticket_identifier.trim();
        if identifier.is_empty() {
            return AdmissionResponse::failed(
                ErrorCode::InvalidInput,
                ErrorCode::InvalidInput.default_message(),
            );
        }
        let verified_by = match request.verified_by.trim() {
            "" => UNATTRIBUTED,
            staff => staff,
        };

        if let Err(e) = self.generator.ensure_for_identifier(identifier).await {
            return generation_failure(identifier, e);
        }

        if !request.auto_admit {
            return match self.verification.verify(identifier).await {
                Ok(data) => AdmissionResponse::resolved(data.with_remaining(), None),
                Err(e) => verification_failure(identifier, e),
            };
        }

        // The write goes first. Reading for display before it would let two
        // devices both see capacity for the same admission.
        let outcome = match self.admission.admit(identifier, verified_by).await {
            Ok(outcome) => outcome,
            Err(AdmissionError::Orphaned(_)) => {
                return AdmissionResponse::failed(
                    ErrorCode::OrphanedTicket,
                    ErrorCode::OrphanedTicket.default_message(),
                )
            }
            Err(AdmissionError::Store(e)) => {
                return AdmissionResponse::failed(
                    ErrorCode::AdmissionFailed,
                    store_failure_message(ErrorCode::AdmissionFailed, &e),
                )
            }
        };

        let committed = match outcome {
            AdmissionOutcome::NotFound => {
                return AdmissionResponse::failed(
                    ErrorCode::TicketNotFound,
                    ErrorCode::TicketNotFound.default_message(),
                )
            }
            AdmissionOutcome::Success { state }
            | AdmissionOutcome::AlreadyUsed { state }
            | AdmissionOutcome::DuplicateScan { state } => state,
        };

        let data = match self.verification.verify(identifier).await {
            Ok(data) => TicketData {
                state: committed,
                ..data
            }
            .with_remaining(),
            // A committed admission is never reported as a failure, or the
            // scanner would retry it and consume a second admission.
            Err(e) if outcome.is_success() => {
                warn!(identifier, verified_by, error = %e, "Admitted but display lookup failed");
                return AdmissionResponse::admitted_without_details(committed);
            }
            Err(e) => return verification_failure(identifier, e),
        };

        match outcome {
            AdmissionOutcome::Success { .. } => {
                info!(identifier, verified_by, remaining = ?data.remaining_tickets, "admitted");
                AdmissionResponse::admitted(data)
            }
            AdmissionOutcome::AlreadyUsed { .. } => {
                info!(identifier, verified_by, "already_used");
                AdmissionResponse::resolved(data, Some(ErrorCode::AlreadyUsed))
            }
            _ => {
                info!(identifier, verified_by, "duplicate_scan");
                AdmissionResponse::resolved(data, Some(ErrorCode::DuplicateScan))
            }
        }
    }
}

fn verification_failure(identifier: &str, err: VerificationError) -> AdmissionResponse {
    match err {
        VerificationError::NotFound(_) => AdmissionResponse::failed(
            ErrorCode::TicketNotFound,
            ErrorCode::TicketNotFound.default_message(),
        ),
        VerificationError::Orphaned(_) => AdmissionResponse::failed(
            ErrorCode::OrphanedTicket,
            ErrorCode::OrphanedTicket.default_message(),
        ),
        VerificationError::Store(e) => {
            error!(identifier, error = %e, "Ticket verification failed");
            AdmissionResponse::failed(
                ErrorCode::VerificationFailed,
                store_failure_message(ErrorCode::VerificationFailed, &e),
            )
        }
    }
}

fn generation_failure(identifier: &str, err: GenerationError) -> AdmissionResponse {
    match err {
        GenerationError::PurchaseNotFound(_) => AdmissionResponse::failed(
            ErrorCode::TicketNotFound,
            ErrorCode::TicketNotFound.default_message(),
        ),
        GenerationError::NotIndividual(purchase_id) => {
            // Guarded by ensure_for_identifier; reaching this means the
            // purchase changed format underneath us.
            error!(identifier, %purchase_id, "Generator refused a purchase it was routed");
            AdmissionResponse::failed(ErrorCode::InternalError, ErrorCode::InternalError.default_message())
        }
        GenerationError::TooManyAdmissions(purchase_id) => {
            error!(identifier, %purchase_id, "Purchase exceeds the admission limit");
            AdmissionResponse::failed(ErrorCode::InternalError, ErrorCode::InternalError.default_message())
        }
        GenerationError::Store(e) => {
            error!(identifier, error = %e, "Individual ticket generation failed");
            AdmissionResponse::failed(
                ErrorCode::VerificationFailed,
                store_failure_message(ErrorCode::VerificationFailed, &e),
            )
        }
    }
}

/// Transient store failures say so in the message; scanners only retry on
/// network-layer wording.
fn store_failure_message(code: ErrorCode, err: &StoreError) -> String {
    if err.is_transient() {
        format!("{}: database connection timeout, try again", code.default_message())
    } else {
        code.default_message().to_string()
    }
}
