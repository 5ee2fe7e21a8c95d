use std::fmt;

use serde::Serialize;

use crate::models::{AdmissionResponse, TicketData};
use crate::utils::error::ErrorCode;

/// Cue played on the door device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    GreenChime,
    AmberChime,
    RedBuzz,
    None,
}

/// How an already-used ticket is presented at the door.
///
/// `Welcome` treats it as a returning guest: amber light and the ticket
/// details, with an audit line. `Deny` shows it as a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlreadyUsedPolicy {
    #[default]
    Welcome,
    Deny,
}

pub const ALREADY_USED_WELCOME: AlreadyUsedPolicy = AlreadyUsedPolicy::Welcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Same code scanned again inside the local window.
    TooSoon,
    /// A request for the same code is still outstanding.
    InFlight,
    /// Too many requests outstanding on this device.
    Busy,
}

/// What the operator sees after one scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanFeedback {
    /// `ticket` is absent when the admission committed but its details
    /// could not be read back.
    Admitted {
        ticket: Option<TicketData>,
        remaining_tickets: Option<i32>,
    },
    Welcome {
        ticket: Option<TicketData>,
        message: String,
    },
    Denied {
        code: Option<ErrorCode>,
        message: String,
        ticket: Option<TicketData>,
    },
    Ignored {
        reason: IgnoreReason,
    },
}

impl ScanFeedback {
    pub fn from_response(response: AdmissionResponse, policy: AlreadyUsedPolicy) -> Self {
        let message = response
            .error_message
            .clone()
            .or_else(|| response.error_code.map(|c| c.default_message().to_string()))
            .unwrap_or_default();
        let remaining_tickets = response.remaining_tickets();

        match (response.admitted, response.error_code, response.ticket_data) {
            (true, _, ticket) => ScanFeedback::Admitted {
                ticket,
                remaining_tickets,
            },
            (_, Some(ErrorCode::AlreadyUsed), ticket) if policy == AlreadyUsedPolicy::Welcome => {
                ScanFeedback::Welcome { ticket, message }
            }
            (_, None, Some(ticket)) => ScanFeedback::Denied {
                code: None,
                message: "Ticket found but not admitted".to_string(),
                ticket: Some(ticket),
            },
            (_, code, ticket) => ScanFeedback::Denied {
                code,
                message,
                ticket,
            },
        }
    }

    pub fn signal(&self) -> Signal {
        match self {
            ScanFeedback::Admitted { .. } => Signal::GreenChime,
            ScanFeedback::Welcome { .. } => Signal::AmberChime,
            ScanFeedback::Denied { .. } => Signal::RedBuzz,
            ScanFeedback::Ignored { .. } => Signal::None,
        }
    }

    pub fn ticket(&self) -> Option<&TicketData> {
        match self {
            ScanFeedback::Admitted { ticket, .. }
            | ScanFeedback::Welcome { ticket, .. }
            | ScanFeedback::Denied { ticket, .. } => ticket.as_ref(),
            ScanFeedback::Ignored { .. } => None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, ScanFeedback::Admitted { .. })
    }
}

impl fmt::Display for ScanFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFeedback::Admitted {
                ticket,
                remaining_tickets,
            } => {
                match ticket {
                    Some(ticket) => {
                        write!(f, "ADMITTED {} ({})", ticket.customer_name, ticket.ticket_type)?
                    }
                    None => write!(f, "ADMITTED (details unavailable)")?,
                }
                if let Some(remaining) = remaining_tickets {
                    write!(f, ", {remaining} remaining")?;
                }
                Ok(())
            }
            ScanFeedback::Welcome { ticket, message } => match ticket {
                Some(ticket) => write!(f, "WELCOME BACK {}: {message}", ticket.customer_name),
                None => write!(f, "WELCOME BACK: {message}"),
            },
            ScanFeedback::Denied { code, message, .. } => match code {
                Some(code) => write!(f, "DENIED [{code}] {message}"),
                None => write!(f, "DENIED {message}"),
            },
            ScanFeedback::Ignored { reason } => write!(f, "ignored ({reason:?})"),
        }
    }
}
