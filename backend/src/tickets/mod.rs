// Ticket Engine
//
// Entity lifecycle, state-machine transitions, the append-only history
// ledger, and bulk operations. All writes to tickets and their history go
// through this module.

pub mod engine;
pub mod history;
pub mod number;
pub mod state;

pub use engine::{
    BulkUpdateOutcome, CreateTicketRequest, TicketEngine, TicketListParams, TicketStats,
    UpdateTicketRequest,
};
pub use state::can_transition;
