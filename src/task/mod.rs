//! Task catalog and completion
//!
//! Join-channel tasks verify synchronously through the membership checker;
//! view-post tasks run a supervised countdown.

pub mod engine;
pub mod timer;

pub use engine::{check_post_url, NewTask, TaskEngine, TaskOutcome};
pub use timer::{TimerEvent, TimerHandle};
