// SLA Engine
//
// Policy matching, working-hour deadline arithmetic, violation detection,
// and escalation application.

pub mod checker;
pub mod deadline;
pub mod policy;

pub use checker::{SlaEngine, SlaSweepResult};
pub use deadline::{FixedHolidays, HolidayOracle, NoHolidays, compute_deadlines};
pub use policy::match_policy;
