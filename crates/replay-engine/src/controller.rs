//! Campaign iteration control.
//!
//! One [`Campaign`] owns one script and drives the run engine through seed
//! after seed: pick the seed (dry run, finite cycle, raw-dump, or the
//! iteration index itself), replay the conversation, then decide what the
//! outcome means — advance, retry the same seed, back off after a crash, or
//! halt the campaign. The controller is the only thread that ever moves the
//! iteration index; the monitor's crash edge is consumed here, exactly once
//! per iteration, at the boundary between runs.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use crate::callbacks::{ErrorDisposition, ExceptionProcessor, MessageProcessor};
use crate::engine::{DumpRaw, RunEngine};
use crate::logger::TranscriptLogger;
use crate::monitor::{self, CrashEdge, MonitorHandle};
use crate::mutator::Mutator;
use crate::script::{FuzzScript, MessageCollection};
use crate::signals::{RunError, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// No sink at all; no log directory is ever created.
    Quiet,
    /// Log crashes and halt-mandated transcripts.
    Normal,
    /// Additionally log every iteration, without de-duplication.
    LogAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    /// More iterations remain; call `run_one` again.
    Continue,
    /// The campaign is over (range exhausted, halt signal, or raw dump done).
    Finished,
}

#[derive(Debug, Clone)]
pub struct CampaignOptions {
    /// First seed of the range.
    pub min: i64,
    /// Last seed of the range, inclusive; `-1` means unbounded.
    pub max: i64,
    /// Finite seed cycle; when non-empty, seeds come from here modulo length.
    pub seed_loop: Vec<u64>,
    /// Raw-dump mode: run this one seed, write wire bytes, stop.
    pub dump_seed: Option<u64>,
    /// Sleep between runs.
    pub sleep: Duration,
    pub log_mode: LogMode,
}

impl Default for CampaignOptions {
    fn default() -> Self {
        Self {
            min: 0,
            max: -1,
            seed_loop: Vec::new(),
            dump_seed: None,
            sleep: Duration::ZERO,
            log_mode: LogMode::Normal,
        }
    }
}

/// What one run amounted to, after folding in the crash edge and the
/// exception processor's verdict.
enum Outcome {
    Clean,
    /// An unrecognized error the exception processor chose to swallow.
    Ignored,
    Crash(String),
    Abort(String),
    Retry(String),
    LogAndHalt(String),
    LogLastAndHalt(String),
    Halt(String),
}

impl From<Signal> for Outcome {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::LogCrash(m) => Outcome::Crash(m),
            Signal::Abort(m) => Outcome::Abort(m),
            Signal::Retry(m) => Outcome::Retry(m),
            Signal::LogAndHalt(m) => Outcome::LogAndHalt(m),
            Signal::LogLastAndHalt(m) => Outcome::LogLastAndHalt(m),
            Signal::Halt(m) => Outcome::Halt(m),
        }
    }
}

pub struct Campaign {
    script: FuzzScript,
    host: String,
    mutator: Mutator,
    options: CampaignOptions,
    processor: Box<dyn MessageProcessor>,
    exceptions: Box<dyn ExceptionProcessor>,
    crash_edge: CrashEdge,
    monitor: Option<MonitorHandle>,
    logger: Option<TranscriptLogger>,
    dump: Option<DumpRaw>,
    /// Iteration index; starts at `min - 1` when a dry run is requested.
    i: i64,
    /// Consecutive crash detections at the current index.
    failure_count: u32,
    /// The previous run's post-run collection, for "log the last iteration".
    previous: MessageCollection,
}

impl Campaign {
    pub fn new(
        script: FuzzScript,
        host: String,
        mutator: Mutator,
        options: CampaignOptions,
        processor: Box<dyn MessageProcessor>,
        exceptions: Box<dyn ExceptionProcessor>,
    ) -> Result<Self> {
        let logger = match options.log_mode {
            LogMode::Quiet => None,
            _ => Some(TranscriptLogger::create(&script.path)?),
        };

        let dump = match options.dump_seed {
            Some(seed) => {
                let dir = match &logger {
                    Some(l) => l.dir().to_path_buf(),
                    None => {
                        let dir = script
                            .path
                            .parent()
                            .unwrap_or_else(|| Path::new("."))
                            .join("dumpraw");
                        std::fs::create_dir_all(&dir)?;
                        dir
                    }
                };
                Some(DumpRaw { dir, seed })
            }
            None => None,
        };

        let crash_edge = CrashEdge::new();
        let monitor = monitor::spawn_monitor(
            &script.processor_dir_path(),
            &host,
            script.port,
            crash_edge.clone(),
        )?;

        let i = if script.dry_run { options.min - 1 } else { options.min };
        let previous = script.messages.clone();

        Ok(Self {
            script,
            host,
            mutator,
            options,
            processor,
            exceptions,
            crash_edge,
            monitor,
            logger,
            dump,
            i,
            failure_count: 0,
            previous,
        })
    }

    pub fn iteration(&self) -> i64 {
        self.i
    }

    pub fn crash_edge(&self) -> &CrashEdge {
        &self.crash_edge
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.logger.as_ref().map(|l| l.dir())
    }

    /// Execute one iteration (plus any immediate retries a `Retry` signal
    /// asks for) and report whether the campaign goes on.
    pub fn run_one(&mut self) -> Result<CampaignStatus> {
        loop {
            // Snapshot before the run: on "log last and halt" this is the
            // previous iteration's conversation.
            let last_collection = self.previous.clone();

            if !self.options.sleep.is_zero() {
                tracing::debug!(
                    "sleeping {:.3}s between runs",
                    self.options.sleep.as_secs_f64()
                );
                std::thread::sleep(self.options.sleep);
            }

            let seed = self.seed_for_run();
            if self.options.dump_seed.is_some() {
                tracing::info!("{}: performing single raw dump case {seed}", self.script.path.display());
            } else if seed < 0 {
                tracing::info!("{}: performing unfuzzed test run", self.script.path.display());
            } else {
                tracing::info!("{}: fuzzing with seed {seed}", self.script.path.display());
            }

            let mut working = self.script.messages.clone();
            let engine = RunEngine {
                script: &self.script,
                host: &self.host,
                mutator: &self.mutator,
                dump: self.dump.as_ref(),
            };
            let result = engine.perform_run(
                &mut working,
                seed,
                self.processor.as_mut(),
                self.logger.as_mut(),
            );

            // The crash edge outranks whatever the run returned; consuming it
            // here attributes the crash to this iteration and clears it
            // before the next one begins.
            let outcome = if self.crash_edge.take() {
                let detail = self
                    .monitor
                    .as_ref()
                    .and_then(|m| m.reports.try_iter().last())
                    .unwrap_or_else(|| "crash reported by monitor".into());
                Outcome::Crash(detail)
            } else {
                match result {
                    Ok(()) => Outcome::Clean,
                    Err(RunError::Signal(signal)) => Outcome::from(signal),
                    Err(other) => match self.exceptions.process(&other) {
                        ErrorDisposition::Ignore => {
                            tracing::warn!("error ignored: {other}");
                            Outcome::Ignored
                        }
                        ErrorDisposition::Escalate(signal) => Outcome::from(signal),
                        ErrorDisposition::Propagate => return Err(other.into()),
                    },
                }
            };

            let log_all = self.options.log_mode == LogMode::LogAll;
            let mut crash_detected = false;

            match outcome {
                Outcome::Clean | Outcome::Ignored => {
                    if log_all {
                        self.emit(self.i, &working, "log-all");
                    }
                }
                Outcome::Crash(reason) => {
                    // Transcript once per index; retries of the same seed are
                    // only logged again in log-all mode.
                    if self.failure_count == 0 {
                        tracing::warn!("crash detected: {reason}");
                        self.emit(self.i, &working, &reason);
                    } else if log_all {
                        self.emit(self.i, &working, "log-all");
                    }
                    self.failure_count += 1;
                    crash_detected = true;
                }
                Outcome::Abort(reason) => {
                    tracing::info!("run aborted: {reason}");
                    if log_all {
                        self.emit(self.i, &working, "log-all");
                    }
                }
                Outcome::Retry(reason) => {
                    tracing::info!("retrying current run: {reason}");
                    if log_all {
                        self.emit(self.i, &working, "log-all");
                    }
                    self.previous = working;
                    continue;
                }
                Outcome::LogAndHalt(reason) => {
                    if self.logger.is_some() {
                        tracing::info!("logging and halting: {reason}");
                        self.emit(self.i, &working, &reason);
                    } else {
                        tracing::info!("halting without logging (quiet mode): {reason}");
                    }
                    return Ok(CampaignStatus::Finished);
                }
                Outcome::LogLastAndHalt(reason) => {
                    match &self.logger {
                        Some(logger) => {
                            if self.options.min == self.options.max && self.i == self.options.min {
                                // Only one case in the whole campaign.
                                tracing::info!("logging the only run and halting: {reason}");
                                logger.emit_previous(self.i, &last_collection, &reason);
                            } else if self.i > self.options.min {
                                tracing::info!("logging previous run and halting: {reason}");
                                logger.emit_previous(self.i - 1, &last_collection, &reason);
                            } else {
                                // The previous run was the unfuzzed test run,
                                // or there was none.
                                tracing::info!("halting; no previous run worth logging: {reason}");
                            }
                        }
                        None => tracing::info!("halting without logging (quiet mode): {reason}"),
                    }
                    return Ok(CampaignStatus::Finished);
                }
                Outcome::Halt(reason) => {
                    tracing::info!("halting: {reason}");
                    if log_all {
                        self.emit(self.i, &working, "log-all");
                    }
                    return Ok(CampaignStatus::Finished);
                }
            }

            self.previous = working;

            // A raw dump is one run, crash or not; never retry or advance.
            if self.options.dump_seed.is_some() {
                return Ok(CampaignStatus::Finished);
            }

            if crash_detected {
                if self.failure_count < self.script.failure_threshold {
                    tracing::info!(
                        "failure {} of {} allowed for seed {}; backing off {:.3}s",
                        self.failure_count,
                        self.script.failure_threshold,
                        self.i,
                        self.script.failure_timeout.as_secs_f64()
                    );
                    std::thread::sleep(self.script.failure_timeout);
                    // Same index again on the next call.
                    return Ok(CampaignStatus::Continue);
                }
                tracing::info!("failed {} times, moving to next test", self.failure_count);
                self.failure_count = 0;
                self.i += 1;
            } else {
                self.i += 1;
            }

            if self.options.max >= 0 && self.i > self.options.max {
                return Ok(CampaignStatus::Finished);
            }
            return Ok(CampaignStatus::Continue);
        }
    }

    fn seed_for_run(&self) -> i64 {
        if let Some(seed) = self.options.dump_seed {
            return seed as i64;
        }
        if self.i == self.options.min - 1 {
            // The unfuzzed dry run.
            return -1;
        }
        if !self.options.seed_loop.is_empty() {
            let len = self.options.seed_loop.len() as i64;
            return self.options.seed_loop[self.i.rem_euclid(len) as usize] as i64;
        }
        self.i
    }

    fn emit(&self, iteration: i64, collection: &MessageCollection, reason: &str) {
        if let Some(logger) = &self.logger {
            logger.emit(iteration, collection, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{HookContext, IdentityProcessor, RethrowingProcessor};
    use crate::script::{Direction, Message, Subcomponent};
    use crate::transport::Transport;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    fn test_script(dir: &Path, port: u16, dry_run: bool, failure_threshold: u32) -> FuzzScript {
        let path = dir.join("session.toml");
        std::fs::write(&path, "").unwrap();
        FuzzScript {
            transport: Transport::Tcp,
            port,
            source_ip: None,
            source_port: None,
            receive_timeout: Duration::from_millis(500),
            failure_threshold,
            failure_timeout: Duration::from_millis(1),
            dry_run,
            processor_dir: "default".into(),
            interface: None,
            messages: MessageCollection {
                messages: vec![Message::new(
                    Direction::Outbound,
                    vec![Subcomponent::new(b"hello".to_vec(), false)],
                )],
            },
            path,
        }
    }

    /// Accepts `conns` connections, draining each until EOF.
    fn accept_server(conns: usize) -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            for _ in 0..conns {
                let (mut conn, _) = listener.accept().unwrap();
                let mut buf = Vec::new();
                let _ = conn.read_to_end(&mut buf);
            }
        });
        (port, handle)
    }

    /// Records the seed handed to every `pre_connect`.
    struct SeedRecorder(Arc<Mutex<Vec<i64>>>);

    impl MessageProcessor for SeedRecorder {
        fn pre_connect(&mut self, seed: i64, _host: &str, _port: u16) -> Result<(), RunError> {
            self.0.lock().unwrap().push(seed);
            Ok(())
        }
    }

    fn quiet_options(min: i64, max: i64) -> CampaignOptions {
        CampaignOptions { min, max, log_mode: LogMode::Quiet, ..Default::default() }
    }

    fn campaign(
        script: FuzzScript,
        options: CampaignOptions,
        processor: Box<dyn MessageProcessor>,
    ) -> Campaign {
        Campaign::new(
            script,
            "127.0.0.1".into(),
            Mutator::new("/nonexistent/bin/radamsa"),
            options,
            processor,
            Box::new(RethrowingProcessor),
        )
        .unwrap()
    }

    #[test]
    fn test_dry_run_then_range_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(2);
        let script = test_script(dir.path(), port, true, 3);
        let seeds = Arc::new(Mutex::new(Vec::new()));
        let mut c = campaign(
            script,
            quiet_options(0, 0),
            Box::new(SeedRecorder(seeds.clone())),
        );

        assert_eq!(c.run_one().unwrap(), CampaignStatus::Continue);
        assert_eq!(c.iteration(), 0);
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();

        // One unfuzzed dry run, then the single in-range seed.
        assert_eq!(*seeds.lock().unwrap(), vec![-1, 0]);
    }

    #[test]
    fn test_finite_seed_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(6);
        let script = test_script(dir.path(), port, false, 3);
        let seeds = Arc::new(Mutex::new(Vec::new()));
        let options = CampaignOptions {
            min: 0,
            max: 5,
            seed_loop: vec![100, 200, 300],
            log_mode: LogMode::Quiet,
            ..Default::default()
        };
        let mut c = campaign(script, options, Box::new(SeedRecorder(seeds.clone())));

        for _ in 0..5 {
            assert_eq!(c.run_one().unwrap(), CampaignStatus::Continue);
        }
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();

        assert_eq!(*seeds.lock().unwrap(), vec![100, 200, 300, 100, 200, 300]);
    }

    #[test]
    fn test_retry_signal_reruns_the_same_seed() {
        struct RetryOnce {
            seeds: Arc<Mutex<Vec<i64>>>,
            failed: bool,
        }
        impl MessageProcessor for RetryOnce {
            fn pre_connect(&mut self, seed: i64, _h: &str, _p: u16) -> Result<(), RunError> {
                self.seeds.lock().unwrap().push(seed);
                Ok(())
            }
            fn pre_send(
                &mut self,
                bytes: Vec<u8>,
                _ctx: &HookContext<'_>,
            ) -> Result<Vec<u8>, RunError> {
                if !self.failed {
                    self.failed = true;
                    return Err(Signal::Retry("transient".into()).into());
                }
                Ok(bytes)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(2);
        let script = test_script(dir.path(), port, false, 3);
        let seeds = Arc::new(Mutex::new(Vec::new()));
        let mut c = campaign(
            script,
            quiet_options(0, 0),
            Box::new(RetryOnce { seeds: seeds.clone(), failed: false }),
        );

        // One call: the retry happens inside it, then the run succeeds.
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();
        assert_eq!(*seeds.lock().unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_failure_threshold_advances_after_retries() {
        struct AlwaysCrash;
        impl MessageProcessor for AlwaysCrash {
            fn pre_send(
                &mut self,
                _bytes: Vec<u8>,
                _ctx: &HookContext<'_>,
            ) -> Result<Vec<u8>, RunError> {
                Err(Signal::LogCrash("target wedged".into()).into())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(2);
        let script = test_script(dir.path(), port, false, 2);
        let mut c = campaign(script, quiet_options(5, 5), Box::new(AlwaysCrash));

        // First crash: below the threshold of 2, so the seed is retried.
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Continue);
        assert_eq!(c.iteration(), 5);
        // Second crash: threshold reached, move past the seed and finish.
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        assert_eq!(c.iteration(), 6);
        server.join().unwrap();
    }

    #[test]
    fn test_crash_edge_attributed_once_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(2);
        let script = test_script(dir.path(), port, false, 2);
        let mut c = campaign(script, quiet_options(0, 0), Box::new(IdentityProcessor));

        c.crash_edge().set();
        // The clean run is turned into a crash by the edge; below threshold,
        // so the seed is retried.
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Continue);
        assert_eq!(c.iteration(), 0);
        assert!(!c.crash_edge().is_set());

        // Edge is clear now, so the retry completes cleanly.
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();
    }

    #[test]
    fn test_quiet_mode_never_creates_a_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(1);
        let script = test_script(dir.path(), port, false, 3);
        let mut c = campaign(script, quiet_options(0, 0), Box::new(IdentityProcessor));

        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();
        assert!(c.log_dir().is_none());
        assert!(!dir.path().join("session_logs").exists());
    }

    #[test]
    fn test_crash_transcript_written_once() {
        struct CrashOnce {
            done: bool,
        }
        impl MessageProcessor for CrashOnce {
            fn pre_send(
                &mut self,
                bytes: Vec<u8>,
                _ctx: &HookContext<'_>,
            ) -> Result<Vec<u8>, RunError> {
                if !self.done {
                    self.done = true;
                    return Err(Signal::LogCrash("no banner after send".into()).into());
                }
                Ok(bytes)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(2);
        let script = test_script(dir.path(), port, false, 2);
        let options = CampaignOptions { min: 0, max: 0, ..Default::default() };
        let mut c = campaign(script, options, Box::new(CrashOnce { done: false }));

        assert_eq!(c.run_one().unwrap(), CampaignStatus::Continue);
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();

        let log_dir = c.log_dir().unwrap().to_path_buf();
        let text = std::fs::read_to_string(log_dir.join("0")).unwrap();
        assert!(text.contains("no banner after send"));
    }

    #[test]
    fn test_log_last_and_halt_logs_previous_iteration() {
        struct HaltOnSecond {
            runs: u32,
        }
        impl MessageProcessor for HaltOnSecond {
            fn pre_connect(&mut self, _seed: i64, _h: &str, _p: u16) -> Result<(), RunError> {
                self.runs += 1;
                if self.runs == 2 {
                    return Err(Signal::LogLastAndHalt("operator stop".into()).into());
                }
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(1);
        let script = test_script(dir.path(), port, false, 3);
        let options = CampaignOptions::default();
        let mut c = campaign(script, options, Box::new(HaltOnSecond { runs: 0 }));

        assert_eq!(c.run_one().unwrap(), CampaignStatus::Continue);
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();

        let log_dir = c.log_dir().unwrap().to_path_buf();
        assert!(log_dir.join("0").exists());
        assert!(!log_dir.join("1").exists());
    }

    #[test]
    fn test_dumpraw_runs_once_and_writes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(1);
        let script = test_script(dir.path(), port, false, 3);
        let options = CampaignOptions {
            dump_seed: Some(3),
            log_mode: LogMode::Quiet,
            ..Default::default()
        };
        let mut c = campaign(script, options, Box::new(IdentityProcessor));

        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();

        let dumped = std::fs::read(dir.path().join("dumpraw").join("0-outbound-seed-3")).unwrap();
        assert_eq!(dumped, b"hello");
    }

    #[test]
    fn test_dumpraw_crash_terminates_after_one_run() {
        struct CrashEveryRun;
        impl MessageProcessor for CrashEveryRun {
            fn pre_send(
                &mut self,
                _bytes: Vec<u8>,
                _ctx: &HookContext<'_>,
            ) -> Result<Vec<u8>, RunError> {
                Err(Signal::LogCrash("known-bad seed".into()).into())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (port, server) = accept_server(1);
        let script = test_script(dir.path(), port, false, 3);
        let options = CampaignOptions {
            dump_seed: Some(9),
            log_mode: LogMode::Quiet,
            ..Default::default()
        };
        let mut c = campaign(script, options, Box::new(CrashEveryRun));

        // One run, crash or not; no retry, no back-off.
        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
        server.join().unwrap();
    }

    #[test]
    fn test_swallowed_error_continues_the_campaign() {
        struct SwallowAll;
        impl ExceptionProcessor for SwallowAll {
            fn process(&self, _error: &RunError) -> ErrorDisposition {
                ErrorDisposition::Ignore
            }
        }

        let dir = tempfile::tempdir().unwrap();
        // Grab a port and close it again: connecting will be refused.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let script = test_script(dir.path(), port, false, 3);
        let mut c = Campaign::new(
            script,
            "127.0.0.1".into(),
            Mutator::new("/nonexistent/bin/radamsa"),
            quiet_options(0, 0),
            Box::new(IdentityProcessor),
            Box::new(SwallowAll),
        )
        .unwrap();

        assert_eq!(c.run_one().unwrap(), CampaignStatus::Finished);
    }

    #[test]
    fn test_rethrown_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let script = test_script(dir.path(), port, false, 3);
        let mut c = campaign(script, quiet_options(0, 0), Box::new(IdentityProcessor));
        assert!(c.run_one().is_err());
    }
}
