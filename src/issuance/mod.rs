//! Ticket issuance: draft assembly, the issuance state machine and the
//! issued ticket model.

mod draft;
mod submitter;
mod ticket;
pub mod workflow;

pub use draft::{SaleChannel, SaleDraft};
pub use submitter::{IssuanceSubmitter, SaleRequest, SubmitError};
pub use ticket::{Download, IssuedTicket, Position};
pub use workflow::{
    describe_failure, Clock, IssuanceAttempt, IssuanceError, IssuanceWorkflow, ManualClock,
    SystemClock,
};
