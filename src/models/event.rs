use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An event as the catalog publishes it. Date and time are kept as the
/// display text the box office printed on the ticket.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub date_text: String,
    pub time_text: String,
    pub venue: String,
    pub created_at: DateTime<Utc>,
}

/// A sellable ticket type. Bundles admit more than one guest per unit sold.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub admissions_per_unit: i32,
    pub created_at: DateTime<Utc>,
}

impl TicketType {
    pub fn is_bundle(&self) -> bool {
        self.admissions_per_unit > 1
    }
}
