//! Message-processor hooks and error dispositions.
//!
//! A message processor customizes a campaign without touching the engine:
//! every hook has a default identity/no-op implementation, so an impl only
//! overrides the stages it cares about. Hooks return `Result` so any of them
//! can raise a steering [`Signal`](crate::signals::Signal) through
//! [`RunError`].

use std::sync::Arc;

use crate::signals::{RunError, Signal};

/// What a hook gets to see about the message it is shaping.
pub struct HookContext<'a> {
    pub message_index: usize,
    /// `None` when the hook applies to the whole message.
    pub part_index: Option<usize>,
    /// The fuzz flag of the part (or message) the hook is called for.
    pub fuzz: bool,
    /// Load-time part payloads, snapshotted once per message.
    pub original_parts: &'a [Arc<[u8]>],
    /// Current working payloads, re-snapshotted immediately before each hook
    /// call so earlier edits in the same message are visible.
    pub current_parts: Vec<Vec<u8>>,
}

/// Lifecycle hooks around one replay of the conversation.
///
/// Call order per outbound message: `pre_fuzz_part` for each part (or
/// `pre_fuzz` for a single-part message), mutation, `pre_send_part` for each
/// part (multi-part only), then `pre_send` on the assembled message. Inbound
/// messages get `post_receive`. `pre_connect` runs once per iteration before
/// the socket exists.
#[allow(unused_variables)]
pub trait MessageProcessor {
    fn pre_connect(&mut self, seed: i64, host: &str, port: u16) -> Result<(), RunError> {
        Ok(())
    }

    /// Whole-message pre-mutation hook, single-part messages only.
    fn pre_fuzz(&mut self, bytes: Vec<u8>, ctx: &HookContext<'_>) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    /// Per-part pre-mutation hook, multi-part messages only.
    fn pre_fuzz_part(
        &mut self,
        bytes: Vec<u8>,
        ctx: &HookContext<'_>,
    ) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    /// Per-part post-mutation hook, multi-part messages only.
    fn pre_send_part(
        &mut self,
        bytes: Vec<u8>,
        ctx: &HookContext<'_>,
    ) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    /// Final whole-message hook; the return value is what goes on the wire.
    fn pre_send(&mut self, bytes: Vec<u8>, ctx: &HookContext<'_>) -> Result<Vec<u8>, RunError> {
        Ok(bytes)
    }

    fn post_receive(&mut self, bytes: &[u8], ctx: &HookContext<'_>) -> Result<(), RunError> {
        Ok(())
    }
}

/// The default processor: every hook passes bytes through untouched.
pub struct IdentityProcessor;

impl MessageProcessor for IdentityProcessor {}

/// What the iteration controller should do with an error the engine did not
/// recognize.
pub enum ErrorDisposition {
    /// Note the error and continue with the next seed.
    Ignore,
    /// Handle as if the run had raised this signal.
    Escalate(Signal),
    /// Fatal; abort the whole campaign.
    Propagate,
}

/// Classifies errors that are not steering signals — connection failures,
/// mutator trouble, unexpected I/O.
pub trait ExceptionProcessor {
    fn process(&self, error: &RunError) -> ErrorDisposition;
}

/// Default: every unrecognized error is fatal.
pub struct RethrowingProcessor;

impl ExceptionProcessor for RethrowingProcessor {
    fn process(&self, _error: &RunError) -> ErrorDisposition {
        ErrorDisposition::Propagate
    }
}
