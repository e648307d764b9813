//! Block enforcement.
//!
//! - `registry`: keyed expiry timers with exactly-once teardown
//! - `engine`: strict/normal mode state machine and block lifecycle
//! - `background`: hand-off to a headless instance and startup recovery

pub mod background;
pub mod engine;
pub mod error;
pub mod registry;

pub use background::{
    hand_off, reap_existing_instance, run_background_loop, start_background, LaunchRole, LockFile,
    MockProcessControl, ProcessControl, ReapOutcome, SystemProcessControl,
};
pub use engine::{ActiveBlock, BlockEngine, BlockStatus, RecoveryOutcome, ResumedBlock};
pub use error::{BlockError, ProcessError};
pub use registry::{BlockRegistry, BlockTeardown, TimerEvent};
