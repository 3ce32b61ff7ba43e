//! The run engine: one complete replay of the conversation for one seed.
//!
//! A run walks the message collection in script order. Outbound messages go
//! through a fixed pipeline — reset to load-time bytes, pre-fuzz callbacks,
//! mutation of fuzzed parts, pre-send callbacks, final whole-message callback
//! — and the result goes on the wire. Inbound messages are received with the
//! scripted length as a hint and handed to the post-receive callback; a
//! mismatch against the script is never an error.
//!
//! `seed = -1` is the dry run: the pipeline runs end to end but the mutator
//! is never spawned, so an identity-callback dry run sends the script's exact
//! load-time bytes.

use std::path::PathBuf;
use std::sync::Arc;

use crate::callbacks::{HookContext, MessageProcessor};
use crate::logger::TranscriptLogger;
use crate::mutator::Mutator;
use crate::script::{FuzzScript, Message, MessageCollection};
use crate::signals::RunError;
use crate::socket::FuzzSocket;

/// Raw byte-dump settings for `--dumpraw` campaigns.
pub struct DumpRaw {
    pub dir: PathBuf,
    pub seed: u64,
}

pub struct RunEngine<'a> {
    pub script: &'a FuzzScript,
    pub host: &'a str,
    pub mutator: &'a Mutator,
    pub dump: Option<&'a DumpRaw>,
}

impl<'a> RunEngine<'a> {
    /// Replay the whole collection once. The socket is opened after the
    /// `pre_connect` hook and closed on every exit path, signal or not.
    pub fn perform_run(
        &self,
        messages: &mut MessageCollection,
        seed: i64,
        processor: &mut dyn MessageProcessor,
        mut logger: Option<&mut TranscriptLogger>,
    ) -> Result<(), RunError> {
        // Reset the logger before anything can fail, so a "log previous run"
        // request after a refused connection still has the right data.
        if let Some(l) = logger.as_deref_mut() {
            l.start_new_run();
        }

        processor.pre_connect(seed, self.host, self.script.port)?;
        let mut sock = FuzzSocket::open(self.script, self.host)?;

        for index in 0..messages.messages.len() {
            let message = &mut messages.messages[index];
            if message.is_outbound() {
                self.run_outbound(message, index, seed, processor, &mut sock)?;
            } else {
                self.run_inbound(message, index, processor, &mut sock, logger.as_deref_mut())?;
            }
            if let Some(l) = logger.as_deref_mut() {
                l.record_highest_index(index);
            }
        }
        Ok(())
    }

    fn run_outbound(
        &self,
        message: &mut Message,
        index: usize,
        seed: i64,
        processor: &mut dyn MessageProcessor,
        sock: &mut FuzzSocket,
    ) -> Result<(), RunError> {
        // Revert fuzzing and callback edits from any earlier activity first.
        message.reset();

        // Originals are snapshotted once per message; the working snapshot is
        // regathered before every hook call so each callback sees all edits
        // made so far.
        let original_parts: Vec<Arc<[u8]>> =
            message.parts.iter().map(|p| p.original().clone()).collect();

        if message.has_parts() {
            for j in 0..message.parts.len() {
                let ctx = HookContext {
                    message_index: index,
                    part_index: Some(j),
                    fuzz: message.parts[j].fuzz,
                    original_parts: &original_parts,
                    current_parts: snapshot(message),
                };
                let rewritten =
                    processor.pre_fuzz_part(message.parts[j].altered().to_vec(), &ctx)?;
                message.parts[j].set_altered(rewritten);
            }
        } else {
            let ctx = HookContext {
                message_index: index,
                part_index: None,
                fuzz: message.is_fuzzed(),
                original_parts: &original_parts,
                current_parts: snapshot(message),
            };
            let rewritten = processor.pre_fuzz(message.parts[0].altered().to_vec(), &ctx)?;
            message.parts[0].set_altered(rewritten);
        }

        // Dry runs (seed -1) never touch the mutator. One seed serves every
        // fuzzed part of the iteration, in index order.
        if seed >= 0 {
            for part in message.parts.iter_mut().filter(|p| p.fuzz) {
                let mutated = self.mutator.mutate(seed as u64, part.altered())?;
                part.set_altered(mutated);
            }
        }

        if message.has_parts() {
            for j in 0..message.parts.len() {
                let ctx = HookContext {
                    message_index: index,
                    part_index: Some(j),
                    fuzz: message.parts[j].fuzz,
                    original_parts: &original_parts,
                    current_parts: snapshot(message),
                };
                let rewritten =
                    processor.pre_send_part(message.parts[j].altered().to_vec(), &ctx)?;
                message.parts[j].set_altered(rewritten);
            }
        }

        // Final whole-message edit; the return value is the wire payload.
        let ctx = HookContext {
            message_index: index,
            part_index: None,
            fuzz: message.is_fuzzed(),
            original_parts: &original_parts,
            current_parts: snapshot(message),
        };
        let payload = processor.pre_send(message.assembled(), &ctx)?;

        if let Some(dump) = self.dump {
            let mut name = format!("{index}-outbound-seed-{}", dump.seed);
            if message.is_fuzzed() {
                name.push_str("-fuzzed");
            }
            std::fs::write(dump.dir.join(name), &payload)?;
        }

        sock.send(&payload)?;
        Ok(())
    }

    fn run_inbound(
        &self,
        message: &mut Message,
        index: usize,
        processor: &mut dyn MessageProcessor,
        sock: &mut FuzzSocket,
        logger: Option<&mut TranscriptLogger>,
    ) -> Result<(), RunError> {
        let expected = message.assembled();
        let data = sock.receive(expected.len())?;
        if data == expected {
            tracing::info!("received expected response");
        }
        if let Some(l) = logger {
            l.record_inbound(index, &data);
        }
        message.received = Some(data.clone());

        let scripted: Vec<Arc<[u8]>> = vec![expected.into()];
        let ctx = HookContext {
            message_index: index,
            part_index: None,
            fuzz: false,
            original_parts: &scripted,
            current_parts: vec![data.clone()],
        };
        processor.post_receive(&data, &ctx)?;

        if let Some(dump) = self.dump {
            let name = format!("{index}-inbound-seed-{}", dump.seed);
            std::fs::write(dump.dir.join(name), &data)?;
        }
        Ok(())
    }
}

fn snapshot(message: &Message) -> Vec<Vec<u8>> {
    message.parts.iter().map(|p| p.altered().to_vec()).collect()
}
