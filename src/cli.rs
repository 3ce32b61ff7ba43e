//! CLI definitions for keelhaul.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "keelhaul",
    version,
    about = "Network protocol mutation fuzzer\n\nReplays a prepared conversation script against a target, mutating outbound bytes with a radamsa-compatible mutator and logging any run that looks like a crash.",
    long_about = None
)]
pub struct Cli {
    /// Path to a conversation script, or a directory of scripts to
    /// round-robin forever
    pub script: PathBuf,

    /// Target to fuzz (literal IPv4/IPv6 address, UNIX socket path, or
    /// "localhost")
    pub target_host: String,

    /// Seconds to sleep between fuzz cases (fractional)
    #[clap(short, long, default_value = "0")]
    pub sleeptime: f64,

    /// Run only the specified cases: X | X- | X-Y
    #[clap(short, long, group = "seed_mode")]
    pub range: Option<String>,

    /// Loop over a finite seed list: N,M,P-Q,...
    #[clap(short = 'l', long = "loop", group = "seed_mode")]
    pub seed_loop: Option<String>,

    /// Run a single seed and dump the raw bytes sent and received
    #[clap(short, long, group = "seed_mode")]
    pub dumpraw: Option<u64>,

    /// Don't log anything
    #[clap(short, long, group = "verbosity")]
    pub quiet: bool,

    /// Log every iteration, not just anomalous ones
    #[clap(long = "log-all", group = "verbosity")]
    pub log_all: bool,

    /// Mutator binary (bare names are searched on PATH)
    #[clap(long, default_value = "radamsa")]
    pub mutator: String,
}

/// Parse a `--range` argument: `X` (just that case), `X-` (unbounded from X),
/// or `X-Y` (inclusive).
pub fn parse_range(text: &str) -> anyhow::Result<(i64, i64)> {
    let parse = |s: &str| -> anyhow::Result<i64> {
        s.parse()
            .map_err(|_| anyhow::anyhow!("invalid test range '{text}'"))
    };
    match text.split_once('-') {
        None => {
            let n = parse(text)?;
            Ok((n, n))
        }
        Some((lo, "")) => Ok((parse(lo)?, -1)),
        Some((lo, hi)) => Ok((parse(lo)?, parse(hi)?)),
    }
}

/// Parse a `--loop` argument: comma-separated seeds and inclusive `N-M`
/// spans, e.g. `1,5,10-12`.
pub fn parse_seed_list(text: &str) -> anyhow::Result<Vec<u64>> {
    let mut seeds = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('-') {
            None => seeds.push(
                token
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid seed '{token}'"))?,
            ),
            Some((lo, hi)) => {
                let lo: u64 = lo
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid seed span '{token}'"))?;
                let hi: u64 = hi
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid seed span '{token}'"))?;
                if hi < lo {
                    anyhow::bail!("backwards seed span '{token}'");
                }
                seeds.extend(lo..=hi);
            }
        }
    }
    if seeds.is_empty() {
        anyhow::bail!("empty seed list '{text}'");
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("7").unwrap(), (7, 7));
        assert_eq!(parse_range("3-").unwrap(), (3, -1));
        assert_eq!(parse_range("1-50").unwrap(), (1, 50));
        assert!(parse_range("1-2-3").is_err());
        assert!(parse_range("x").is_err());
    }

    #[test]
    fn test_parse_seed_list_forms() {
        assert_eq!(parse_seed_list("100,200,300").unwrap(), vec![100, 200, 300]);
        assert_eq!(parse_seed_list("1,5,10-12").unwrap(), vec![1, 5, 10, 11, 12]);
        assert!(parse_seed_list("12-10").is_err());
        assert!(parse_seed_list("").is_err());
    }
}
