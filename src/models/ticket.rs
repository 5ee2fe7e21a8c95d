use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::purchase::{PurchaseDetails, UnitFormat};

/// Shared-counter unit for purchases recorded before individual tickets
/// existed. Identified by the purchase code.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct LegacyTicket {
    pub purchase_code: String,
    pub purchase_id: Uuid,
    pub use_count: i32,
    pub total_quantity: i32,
    pub last_admitted_at: Option<DateTime<Utc>>,
}

/// One admission with its own code.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct IndividualTicket {
    pub ticket_code: String,
    pub purchase_id: Uuid,
    pub ordinal: i32,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<String>,
    pub admitted_via: Option<String>,
}

/// Anything a scanned identifier can resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemableUnit {
    LegacyAggregate(LegacyTicket),
    IndividualUnit(IndividualTicket),
    /// The purchase code of an individual-format purchase. Admitting it
    /// consumes the lowest unused ordinal.
    IndividualSet {
        purchase_id: Uuid,
        purchase_code: String,
        tickets: Vec<IndividualTicket>,
    },
}

/// The row a successful admission changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumedRow {
    Legacy { purchase_code: String },
    Individual { ticket_code: String },
}

impl RedeemableUnit {
    pub fn identifier(&self) -> &str {
        match self {
            RedeemableUnit::LegacyAggregate(t) => &t.purchase_code,
            RedeemableUnit::IndividualUnit(t) => &t.ticket_code,
            RedeemableUnit::IndividualSet { purchase_code, .. } => purchase_code,
        }
    }

    pub fn purchase_id(&self) -> Uuid {
        match self {
            RedeemableUnit::LegacyAggregate(t) => t.purchase_id,
            RedeemableUnit::IndividualUnit(t) => t.purchase_id,
            RedeemableUnit::IndividualSet { purchase_id, .. } => *purchase_id,
        }
    }

    pub fn format(&self) -> UnitFormat {
        match self {
            RedeemableUnit::LegacyAggregate(_) => UnitFormat::LegacyAggregate,
            _ => UnitFormat::Individual,
        }
    }

    pub fn used(&self) -> i32 {
        match self {
            RedeemableUnit::LegacyAggregate(t) => t.use_count,
            RedeemableUnit::IndividualUnit(t) => i32::from(t.is_used),
            RedeemableUnit::IndividualSet { tickets, .. } => {
                tickets.iter().filter(|t| t.is_used).count() as i32
            }
        }
    }

    pub fn capacity(&self) -> i32 {
        match self {
            RedeemableUnit::LegacyAggregate(t) => t.total_quantity,
            RedeemableUnit::IndividualUnit(_) => 1,
            RedeemableUnit::IndividualSet { tickets, .. } => tickets.len() as i32,
        }
    }

    pub fn remaining(&self) -> i32 {
        (self.capacity() - self.used()).max(0)
    }

    /// Most recent admission recorded against this identifier. For a
    /// purchase code, tickets consumed through their own codes don't count.
    pub fn last_admitted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RedeemableUnit::LegacyAggregate(t) => t.last_admitted_at,
            RedeemableUnit::IndividualUnit(t) => t.used_at,
            RedeemableUnit::IndividualSet {
                purchase_code,
                tickets,
                ..
            } => tickets
                .iter()
                .filter(|t| t.admitted_via.as_deref() == Some(purchase_code.as_str()))
                .filter_map(|t| t.used_at)
                .max(),
        }
    }

    pub fn state(&self) -> UnitState {
        match self {
            RedeemableUnit::IndividualUnit(t) => UnitState::Single {
                is_used: t.is_used,
                used_at: t.used_at,
            },
            _ => UnitState::Counter {
                use_count: self.used(),
                total_quantity: self.capacity(),
            },
        }
    }

    /// Takes one admission off the unit. Returns `None` when nothing is left,
    /// leaving the unit untouched.
    pub fn consume(&mut self, at: DateTime<Utc>, verified_by: &str) -> Option<ConsumedRow> {
        match self {
            RedeemableUnit::LegacyAggregate(t) => {
                if t.use_count >= t.total_quantity {
                    return None;
                }
                t.use_count += 1;
                t.last_admitted_at = Some(at);
                Some(ConsumedRow::Legacy {
                    purchase_code: t.purchase_code.clone(),
                })
            }
            RedeemableUnit::IndividualUnit(t) => {
                let via = t.ticket_code.clone();
                mark_used(t, at, verified_by, via)
            }
            RedeemableUnit::IndividualSet {
                purchase_code,
                tickets,
                ..
            } => tickets
                .iter_mut()
                .filter(|t| !t.is_used)
                .min_by_key(|t| t.ordinal)
                .and_then(|t| mark_used(t, at, verified_by, purchase_code.clone())),
        }
    }
}

fn mark_used(
    ticket: &mut IndividualTicket,
    at: DateTime<Utc>,
    verified_by: &str,
    via: String,
) -> Option<ConsumedRow> {
    if ticket.is_used {
        return None;
    }
    ticket.is_used = true;
    ticket.used_at = Some(at);
    ticket.used_by = Some(verified_by.to_string());
    ticket.admitted_via = Some(via);
    Some(ConsumedRow::Individual {
        ticket_code: ticket.ticket_code.clone(),
    })
}

/// Redemption counters as shown to door staff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum UnitState {
    Counter { use_count: i32, total_quantity: i32 },
    Single {
        is_used: bool,
        used_at: Option<DateTime<Utc>>,
    },
}

impl UnitState {
    pub fn remaining(&self) -> i32 {
        match self {
            UnitState::Counter {
                use_count,
                total_quantity,
            } => (total_quantity - use_count).max(0),
            UnitState::Single { is_used, .. } => {
                if *is_used {
                    0
                } else {
                    1
                }
            }
        }
    }
}

/// Read-only projection of a scanned identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketData {
    pub identifier: String,
    pub purchase_id: Uuid,
    pub purchase_code: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub event_title: String,
    pub event_date: String,
    pub event_time: String,
    pub venue: String,
    pub ticket_type: String,
    pub quantity: i32,
    pub price: Decimal,
    pub currency: String,
    pub unit_format: UnitFormat,
    #[serde(flatten)]
    pub state: UnitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_tickets: Option<i32>,
}

impl TicketData {
    pub fn project(details: &PurchaseDetails, unit: &RedeemableUnit) -> Self {
        let purchase = &details.purchase;
        Self {
            identifier: unit.identifier().to_string(),
            purchase_id: purchase.id,
            purchase_code: purchase.purchase_code.clone(),
            customer_name: purchase.customer_name.clone(),
            customer_email: purchase.customer_email.clone(),
            customer_phone: purchase.customer_phone.clone(),
            event_title: details.event.title.clone(),
            event_date: details.event.date_text.clone(),
            event_time: details.event.time_text.clone(),
            venue: details.event.venue.clone(),
            ticket_type: details.ticket_type.name.clone(),
            quantity: purchase.quantity,
            price: purchase.price,
            currency: purchase.currency.clone(),
            unit_format: unit.format(),
            state: unit.state(),
            remaining_tickets: None,
        }
    }

    /// Sets `remaining_tickets` from the current counters.
    pub fn with_remaining(mut self) -> Self {
        self.remaining_tickets = Some(self.state.remaining());
        self
    }
}
