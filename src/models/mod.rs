pub mod admission;
pub mod event;
pub mod purchase;
pub mod ticket;

pub use admission::{AdmissionRequest, AdmissionResponse, DETAILS_UNAVAILABLE};
pub use event::{Event, TicketType};
pub use purchase::{NewPurchase, Purchase, PurchaseDetails, UnitFormat};
pub use ticket::{
    ConsumedRow, IndividualTicket, LegacyTicket, RedeemableUnit, TicketData, UnitState,
};
