//! keelhaul — network protocol mutation fuzzer.
//!
//! Takes a prepared conversation script (or a directory of them) and a target
//! host, and replays the conversation over and over with deterministic
//! byte-level mutation of the outbound messages. Run `keelhaul --help` for
//! usage.

use anyhow::{bail, Context, Result};
use clap::Parser;
use replay_engine::{
    Campaign, CampaignOptions, CampaignStatus, FuzzScript, IdentityProcessor, LogMode, Mutator,
    RethrowingProcessor,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{parse_range, parse_seed_list, Cli};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    // Startup failures (missing mutator, bad range, unreadable script) exit
    // non-zero before any fuzzing begins.
    let mutator = Mutator::locate(&cli.mutator)?;

    let (min, max) = match &cli.range {
        Some(range) => parse_range(range)?,
        None => (0, -1),
    };
    let seed_loop = match &cli.seed_loop {
        Some(list) => parse_seed_list(list)?,
        None => Vec::new(),
    };
    let log_mode = if cli.quiet {
        LogMode::Quiet
    } else if cli.log_all {
        LogMode::LogAll
    } else {
        LogMode::Normal
    };

    let mut campaigns = Vec::new();
    for path in collect_script_files(&cli.script)? {
        tracing::info!("reading script from {}", path.display());
        let script = FuzzScript::load(&path)?;
        let options = CampaignOptions {
            min,
            max,
            seed_loop: seed_loop.clone(),
            dump_seed: cli.dumpraw,
            sleep: Duration::from_secs_f64(cli.sleeptime),
            log_mode,
        };
        campaigns.push(Campaign::new(
            script,
            cli.target_host.clone(),
            mutator.clone(),
            options,
            Box::new(IdentityProcessor),
            Box::new(RethrowingProcessor),
        )?);
    }

    replay_engine::install_interrupt_handler();

    // Round-robin: one iteration per campaign per pass, forever. The first
    // campaign to finish its range (or raise a halt) ends the whole run.
    loop {
        for campaign in &mut campaigns {
            if replay_engine::interrupted() {
                tracing::info!("interrupt received, stopping");
                return Ok(());
            }
            if campaign.run_one()? == CampaignStatus::Finished {
                return Ok(());
            }
        }
    }
}

/// A directory means "every script in it"; a file means just that one.
fn collect_script_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("failed to read script directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no script files found in {}", path.display());
    }
    Ok(files)
}
