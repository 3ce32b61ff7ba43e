//! replay-engine — scripted conversation replay with byte-level mutation.
//!
//! The engine takes a prepared conversation script, replays it against a
//! target endpoint seed after seed, mutates the outbound bytes through an
//! external radamsa-style oracle, and coordinates with an external crash
//! monitor so anomalous iterations get logged for later reproduction.

pub mod callbacks;
pub mod controller;
pub mod engine;
pub mod logger;
pub mod monitor;
pub mod mutator;
pub mod script;
pub mod signals;
pub mod socket;
pub mod transport;

pub use callbacks::{
    ErrorDisposition, ExceptionProcessor, HookContext, IdentityProcessor, MessageProcessor,
    RethrowingProcessor,
};
pub use controller::{Campaign, CampaignOptions, CampaignStatus, LogMode};
pub use engine::{DumpRaw, RunEngine};
pub use logger::TranscriptLogger;
pub use monitor::{install_interrupt_handler, interrupted, CrashEdge};
pub use mutator::Mutator;
pub use script::{Direction, FuzzScript, Message, MessageCollection, Subcomponent};
pub use signals::{RunError, Signal};
pub use socket::{resolve_target, FuzzSocket, TargetAddr};
pub use transport::Transport;
