//! Application reliability core (§4.7): update merge/persist/resend and the
//! undelivered-message reconnect watchdog.

pub mod log;
pub mod update;
pub mod watchdog;

pub use log::{HistoryEntry, NullSink, Sender, UpdateLog, UpdateSink};
pub use update::{MarkerField, ReactionField, TextField, Update};
