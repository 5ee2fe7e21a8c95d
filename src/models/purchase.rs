use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{Event, TicketType};

/// How a purchase is redeemed at the door. Chosen once when the purchase is
/// recorded and stored with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitFormat {
    /// One shared counter for the whole purchase.
    LegacyAggregate,
    /// One ticket code per admission.
    Individual,
}

impl UnitFormat {
    /// Purchases admitting more than one guest made at or after `cutover`
    /// get individual tickets. Everything else keeps the shared counter.
    pub fn select(
        total_admissions: i32,
        purchased_at: DateTime<Utc>,
        cutover: DateTime<Utc>,
    ) -> Self {
        if total_admissions > 1 && purchased_at >= cutover {
            UnitFormat::Individual
        } else {
            UnitFormat::LegacyAggregate
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitFormat::LegacyAggregate => "legacy_aggregate",
            UnitFormat::Individual => "individual",
        }
    }
}

impl fmt::Display for UnitFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown unit format '{0}'")]
pub struct UnknownUnitFormat(pub String);

impl FromStr for UnitFormat {
    type Err = UnknownUnitFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy_aggregate" => Ok(UnitFormat::LegacyAggregate),
            "individual" => Ok(UnitFormat::Individual),
            other => Err(UnknownUnitFormat(other.to_string())),
        }
    }
}

/// One completed checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: Uuid,
    pub purchase_code: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub currency: String,
    pub unit_format: UnitFormat,
    pub purchased_at: DateTime<Utc>,
}

/// What checkout hands over when an order completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPurchase {
    pub customer_name: String,
    pub customer_email: String,
    #[serde(default)]
    pub customer_phone: Option<String>,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub purchased_at: Option<DateTime<Utc>>,
}

/// A purchase together with the catalog rows needed to display it.
#[derive(Debug, Clone)]
pub struct PurchaseDetails {
    pub purchase: Purchase,
    pub event: Event,
    pub ticket_type: TicketType,
}

impl PurchaseDetails {
    /// `None` when the product overflows or exceeds
    /// [`MAX_ADMISSIONS_PER_PURCHASE`].
    pub fn total_admissions(&self) -> Option<i32> {
        total_admissions(self.purchase.quantity, self.ticket_type.admissions_per_unit)
    }
}

/// Upper bound on the admissions one purchase may carry.
pub const MAX_ADMISSIONS_PER_PURCHASE: i32 = 1_000;

pub fn total_admissions(quantity: i32, admissions_per_unit: i32) -> Option<i32> {
    quantity
        .checked_mul(admissions_per_unit)
        .filter(|total| (1..=MAX_ADMISSIONS_PER_PURCHASE).contains(total))
}
