//! External mutation oracle adapter.
//!
//! The oracle is a radamsa-style child process: `<program> --seed <N>`,
//! input bytes on stdin, mutated bytes on stdout. The same seed and input
//! always produce the same output, which is what makes runs reproducible.
//! Each call spawns an independent child; the adapter keeps no state.

use anyhow::{bail, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::signals::RunError;

#[derive(Debug, Clone)]
pub struct Mutator {
    program: PathBuf,
}

impl Mutator {
    /// Wrap a program path without checking it. Prefer [`Mutator::locate`],
    /// which verifies the binary exists before the campaign starts.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Resolve the mutator binary at startup. An explicit path must name an
    /// executable file; a bare name is searched on `PATH`.
    pub fn locate(program: &str) -> Result<Self> {
        let candidate = Path::new(program);
        if candidate.components().count() > 1 {
            if is_executable(candidate) {
                return Ok(Self { program: candidate.to_path_buf() });
            }
            bail!("could not find an executable mutator at {}... did you build it?", program);
        }
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path_var) {
            let full = dir.join(program);
            if is_executable(&full) {
                return Ok(Self { program: full });
            }
        }
        bail!("could not find mutator '{}' on PATH", program);
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run one mutation: feed `input` to a fresh child, return its stdout
    /// verbatim. Exit status is not inspected; stderr is discarded.
    pub fn mutate(&self, seed: u64, input: &[u8]) -> Result<Vec<u8>, RunError> {
        let mut child = Command::new(&self.program)
            .arg("--seed")
            .arg(seed.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                RunError::MutatorUnavailable(format!("{}: {e}", self.program.display()))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunError::MutatorUnavailable("child stdin not piped".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::MutatorUnavailable("child stdout not piped".into()))?;

        // Feed stdin from a helper thread: the child may start writing before
        // it has consumed all of its input, and a single-threaded
        // write-then-read can deadlock on full pipes.
        let payload = input.to_vec();
        let writer = std::thread::Builder::new()
            .name("mutator-stdin".into())
            .spawn(move || {
                let _ = stdin.write_all(&payload);
            })?;

        let mut output = Vec::new();
        stdout.read_to_end(&mut output)?;
        let _ = writer.join();
        let _ = child.wait();
        Ok(output)
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn stub_mutator(dir: &Path, body: &str) -> Mutator {
        let path = dir.join("mutator");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        Mutator::locate(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_locate_rejects_missing_path() {
        assert!(Mutator::locate("/nonexistent/bin/radamsa").is_err());
    }

    #[test]
    fn test_locate_rejects_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutator");
        std::fs::write(&path, "#!/bin/sh\nexec cat\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&path, perms).unwrap();
        assert!(Mutator::locate(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_mutate_passes_stdin_through() {
        let dir = tempfile::tempdir().unwrap();
        let mutator = stub_mutator(dir.path(), "exec cat");
        let out = mutator.mutate(7, b"hello world").unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_seed_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        // $1 = "--seed", $2 = the decimal seed.
        let mutator = stub_mutator(dir.path(), "cat > /dev/null; printf '%s' \"$2\"");
        let out = mutator.mutate(424242, b"ignored").unwrap();
        assert_eq!(out, b"424242");
    }

    #[test]
    fn test_missing_binary_is_mutator_unavailable() {
        let mutator = Mutator { program: PathBuf::from("/nonexistent/bin/radamsa") };
        match mutator.mutate(1, b"x") {
            Err(RunError::MutatorUnavailable(_)) => {}
            other => panic!("expected MutatorUnavailable, got {other:?}"),
        }
    }
}
