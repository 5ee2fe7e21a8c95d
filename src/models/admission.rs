use serde::{Deserialize, Serialize};

use super::ticket::{TicketData, UnitState};
use crate::utils::error::ErrorCode;

fn default_auto_admit() -> bool {
    true
}

/// A single scan as sent by a door device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionRequest {
    #[serde(default)]
    pub ticket_identifier: String,
    #[serde(default)]
    pub verified_by: String,
    #[serde(default = "default_auto_admit")]
    pub auto_admit: bool,
}

impl AdmissionRequest {
    pub fn admit(ticket_identifier: impl Into<String>, verified_by: impl Into<String>) -> Self {
        Self {
            ticket_identifier: ticket_identifier.into(),
            verified_by: verified_by.into(),
            auto_admit: true,
        }
    }

    pub fn lookup(ticket_identifier: impl Into<String>, verified_by: impl Into<String>) -> Self {
        Self {
            auto_admit: false,
            ..Self::admit(ticket_identifier, verified_by)
        }
    }
}

/// The unified answer to one scan.
///
/// `success` means the identifier resolved to a real ticket. `admitted` is
/// only true when this very call consumed an admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionResponse {
    pub success: bool,
    pub admitted: bool,
    pub ticket_data: Option<TicketData>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    /// Counters this call committed, sent when the ticket details could not
    /// be read back after the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_state: Option<UnitState>,
}

pub const DETAILS_UNAVAILABLE: &str = "Admitted; ticket details unavailable";

impl AdmissionResponse {
    pub fn admitted(ticket_data: TicketData) -> Self {
        Self {
            success: true,
            admitted: true,
            ticket_data: Some(ticket_data),
            error_code: None,
            error_message: None,
            committed_state: None,
        }
    }

    /// The write committed but the display read failed. Still an admission.
    pub fn admitted_without_details(state: UnitState) -> Self {
        Self {
            success: true,
            admitted: true,
            ticket_data: None,
            error_code: None,
            error_message: Some(DETAILS_UNAVAILABLE.to_string()),
            committed_state: Some(state),
        }
    }

    /// Resolved without admitting: a lookup, or a soft rejection such as
    /// `ALREADY_USED`.
    pub fn resolved(ticket_data: TicketData, code: Option<ErrorCode>) -> Self {
        Self {
            success: true,
            admitted: false,
            ticket_data: Some(ticket_data),
            error_code: code,
            error_message: code.map(|c| c.default_message().to_string()),
            committed_state: None,
        }
    }

    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            admitted: false,
            ticket_data: None,
            error_code: Some(code),
            error_message: Some(message.into()),
            committed_state: None,
        }
    }

    pub fn remaining_tickets(&self) -> Option<i32> {
        self.ticket_data
            .as_ref()
            .and_then(|d| d.remaining_tickets)
            .or_else(|| self.committed_state.map(|s| s.remaining()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_admit_defaults_to_true() {
        let request: AdmissionRequest =
            serde_json::from_str(r#"{"ticket_identifier": "ORD-1"}"#).unwrap();
        assert!(request.auto_admit);
        assert!(request.verified_by.is_empty());
    }

    #[test]
    fn test_failed_response_has_no_ticket_data() {
        let response = AdmissionResponse::failed(ErrorCode::TicketNotFound, "nope");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "TICKET_NOT_FOUND");
        assert!(json["ticket_data"].is_null());
        assert!(json.get("committed_state").is_none());
    }

    #[test]
    fn test_admitted_without_details_still_counts() {
        let response = AdmissionResponse::admitted_without_details(UnitState::Counter {
            use_count: 1,
            total_quantity: 3,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["admitted"], true);
        assert!(json["error_code"].is_null());
        assert_eq!(json["committed_state"]["use_count"], 1);
        assert_eq!(response.remaining_tickets(), Some(2));
    }
}
