pub mod generator;
pub mod orchestrator;
pub mod procedure;
pub mod registration;
pub mod verification;

pub use generator::{GenerationError, IndividualTicketGenerator};
pub use orchestrator::AdmissionOrchestrator;
pub use procedure::{AdmissionError, AdmissionOutcome, AdmissionPolicy, AdmissionProcedure};
pub use registration::{PurchaseRegistry, RegistrationError};
pub use verification::{VerificationError, VerificationProcedure};
