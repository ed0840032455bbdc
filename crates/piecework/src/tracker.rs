//! The interface to trackers.
//!
//! Talking to trackers is done elsewhere, the engine only reports lifecycle
//! events of a transfer through [`Announcer`].
use std::fmt::Debug;

use crate::{error::Error, transfer::InfoHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    None = 0,
    Completed = 1,
    #[default]
    Started = 2,
    Stopped = 3,
}

/// A tracker that a transfer reports to.
pub trait Announcer: Send + Sync + Debug {
    /// Tell the tracker about `event` of the transfer with `info_hash`.
    fn announce(&self, info_hash: &InfoHash, event: Event) -> Result<(), Error>;
}
