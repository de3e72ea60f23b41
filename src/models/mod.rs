pub mod event;
pub mod stats;

pub use event::{month_start, Event, InvalidEventError};
pub use stats::{StatAction, StatCounter};
