//! Queue construction options and their validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration invariant violations; construction fails on any of them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("erase_age ({erase_age:?}) must be at least idle_age ({idle_age:?})")]
    EraseAgeTooShort {
        erase_age: Duration,
        idle_age: Duration,
    },
    #[error("check_time ({check_time:?}) must be shorter than idle_age ({idle_age:?})")]
    CheckTimeTooLong {
        check_time: Duration,
        idle_age: Duration,
    },
    #[error("heap_branching must be at least 2, got {0}")]
    BranchingTooSmall(u32),
}

/// Options recognized by [`PullQueue`](crate::PullQueue) and
/// [`PushQueue`](crate::PushQueue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Inactivity age after which a client is marked idle.
    pub idle_age: Duration,
    /// Inactivity age after which an idle client is erased from the map.
    pub erase_age: Duration,
    /// Period of the background cleanup pass.
    pub check_time: Duration,
    /// Maximum erasures per cleanup pass, bounding lock hold time.
    pub erase_max: u32,
    /// Dispatch by lowest proportion/reservation tag even when nothing is
    /// within its limit. Off by default.
    pub allow_limit_break: bool,
    /// Maintain the optional fifth heap ordered by proportion alone.
    pub use_prop_heap: bool,
    /// Recompute a request's tag when it reaches the head of its client's
    /// queue, using the client's most recent feedback. On by default.
    pub delay_tag_calc: bool,
    /// Branching factor of the tag heaps.
    pub heap_branching: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            idle_age: Duration::from_secs(300),
            erase_age: Duration::from_secs(600),
            check_time: Duration::from_secs(60),
            erase_max: 100,
            allow_limit_break: false,
            use_prop_heap: false,
            delay_tag_calc: true,
            heap_branching: 2,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.erase_age < self.idle_age {
            return Err(ConfigError::EraseAgeTooShort {
                erase_age: self.erase_age,
                idle_age: self.idle_age,
            });
        }
        if self.check_time >= self.idle_age {
            return Err(ConfigError::CheckTimeTooLong {
                check_time: self.check_time,
                idle_age: self.idle_age,
            });
        }
        if self.heap_branching < 2 {
            return Err(ConfigError::BranchingTooSmall(self.heap_branching));
        }
        Ok(())
    }
}
