//! Ports - the capabilities the protocol needs from the outside world.
//!
//! Every side effect the protocol performs goes through one of these traits,
//! so the protocol itself can be exercised against in-memory stand-ins.

pub mod clock;
pub mod id_generator;
pub mod sleeper;
pub mod substrate;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use self::substrate::{ChangeSet, PublishOutcome, Revision, Snapshot, Substrate};
