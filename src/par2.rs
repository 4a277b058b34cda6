//! PAR2 recovery file generation via the external par2 binary
//!
//! The runner stages a full recovery set (main `.par2` plus `vol*.par2`
//! volumes) for one input file into an output directory before posting
//! begins. Existing recovery sets are reused without spawning the process.

use crate::config::Par2Config;
use crate::error::{Error, Par2Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Most PAR2 implementations refuse inputs that would exceed this many blocks
const MAX_BLOCK_COUNT: u64 = 32_768;

/// Runs the external PAR2 binary for one input file
pub struct Par2Runner {
    binary_path: PathBuf,
    config: Par2Config,
}

impl Par2Runner {
    /// Create a runner, resolving the binary from config or PATH.
    ///
    /// Tries `par2` first, then `parpar`, when no explicit path is set.
    pub fn new(config: Par2Config) -> Result<Self> {
        let binary_path = match &config.par2_path {
            Some(path) => path.clone(),
            None => which::which("par2")
                .or_else(|_| which::which("parpar"))
                .map_err(|e| {
                    Error::Par2(Par2Error::Spawn(format!("no par2 binary found: {}", e)))
                })?,
        };

        Ok(Self {
            binary_path,
            config,
        })
    }

    /// Create a runner with an explicit binary path (used by tests).
    pub fn with_binary(binary_path: PathBuf, config: Par2Config) -> Self {
        Self {
            binary_path,
            config,
        }
    }

    /// Generate recovery files for `input` into `output_dir`.
    ///
    /// Reuses a pre-existing recovery set for the same base name. Streams
    /// percentage progress to `on_progress` as it is parsed from the process
    /// output. Returns the full set of recovery paths (main + volumes).
    pub async fn create<F>(
        &self,
        cancel: &CancellationToken,
        input: &Path,
        output_dir: &Path,
        mut on_progress: F,
    ) -> Result<Vec<PathBuf>>
    where
        F: FnMut(f32) + Send,
    {
        let stem = input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Other(format!("input has no file name: {}", input.display())))?;

        tokio::fs::create_dir_all(output_dir).await?;

        // Reuse an existing recovery set rather than regenerate it
        if let Some(existing) = self.existing_recovery_set(output_dir, stem).await? {
            tracing::info!(
                input = %input.display(),
                files = existing.len(),
                "Reusing existing PAR2 recovery set"
            );
            on_progress(100.0);
            return Ok(existing);
        }

        let input_size = tokio::fs::metadata(input).await?.len();
        let block_size = self.effective_block_size(input_size);
        let main_par2 = output_dir.join(format!("{stem}.par2"));

        let mut cmd = Command::new(&self.binary_path);
        if self.is_parpar() {
            cmd.arg(format!("-s{block_size}"))
                .arg(format!("-r{}", self.config.redundancy))
                .args(&self.config.extra_par2_options)
                .arg("-o")
                .arg(&main_par2)
                .arg(input);
        } else {
            cmd.arg("create")
                .arg(format!("-s{block_size}"))
                .arg(format!("-r{}", self.config.redundancy))
                .args(&self.config.extra_par2_options)
                .arg(&main_par2)
                .arg(input);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW: no console flash on desktop hosts
            cmd.creation_flags(0x0800_0000);
        }

        tracing::debug!(
            binary = %self.binary_path.display(),
            input = %input.display(),
            block_size = block_size,
            redundancy = self.config.redundancy,
            "Spawning PAR2 process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Par2(Par2Error::Spawn(e.to_string())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Par2(Par2Error::Spawn("missing stdout pipe".to_string())))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Par2(Par2Error::Spawn("missing stderr pipe".to_string())))?;

        // Drain stderr concurrently so the child cannot block on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let percent_re = Regex::new(r"(\d{1,3}(?:\.\d+)?)%")
            .map_err(|e| Error::Other(format!("invalid progress regex: {}", e)))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = stderr_task.await;
                    return Err(Error::Cancelled);
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if let Some(caps) = percent_re.captures(&line)
                                && let Ok(percent) = caps[1].parse::<f32>()
                            {
                                on_progress(percent.min(100.0));
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = stderr_task.await;
                return Err(Error::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr_text = stderr_task.await.unwrap_or_default();
        let code = status.code().unwrap_or(-1);

        if let Some(err) = Par2Error::from_exit_code(code, stderr_tail(&stderr_text)) {
            tracing::error!(
                input = %input.display(),
                code = code,
                "PAR2 process failed"
            );
            return Err(Error::Par2(err));
        }

        on_progress(100.0);

        let produced = self
            .existing_recovery_set(output_dir, stem)
            .await?
            .unwrap_or_default();
        if produced.is_empty() {
            return Err(Error::Par2(Par2Error::Unexpected {
                code: 0,
                stderr: "process succeeded but produced no recovery files".to_string(),
            }));
        }

        tracing::info!(
            input = %input.display(),
            files = produced.len(),
            "PAR2 recovery set generated"
        );

        Ok(produced)
    }

    /// Double the configured block size until the block count fits under the
    /// platform cap and the configured slice limit.
    fn effective_block_size(&self, input_size: u64) -> u64 {
        let cap = MAX_BLOCK_COUNT.min(self.config.max_input_slices.max(1) as u64);
        let mut block_size = self.config.volume_size.max(1);
        while input_size.div_ceil(block_size) > cap {
            block_size *= 2;
        }
        block_size
    }

    /// Collect `<stem>.par2` plus its volumes, or `None` when the main file
    /// is absent.
    async fn existing_recovery_set(
        &self,
        output_dir: &Path,
        stem: &str,
    ) -> Result<Option<Vec<PathBuf>>> {
        let main = output_dir.join(format!("{stem}.par2"));
        if !main.exists() {
            return Ok(None);
        }

        let volume_prefix = format!("{stem}.vol");
        let mut files = vec![main];

        let mut entries = tokio::fs::read_dir(output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&volume_prefix) && name.ends_with(".par2") {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(Some(files))
    }

    fn is_parpar(&self) -> bool {
        self.binary_path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("parpar"))
    }
}

/// Last few hundred bytes of stderr, enough for diagnostics without logging
/// megabytes
fn stderr_tail(stderr: &str) -> &str {
    let len = stderr.len();
    let mut start = len.saturating_sub(512);
    // Avoid splitting a UTF-8 character
    while start < len && !stderr.is_char_boundary(start) {
        start += 1;
    }
    &stderr[start..]
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Par2Config;
    use tempfile::TempDir;

    fn runner_with(config: Par2Config) -> Par2Runner {
        Par2Runner::with_binary(PathBuf::from("/nonexistent/par2"), config)
    }

    #[test]
    fn block_size_doubles_under_the_cap() {
        let runner = runner_with(Par2Config {
            volume_size: 1024,
            max_input_slices: 1_000_000,
            ..Default::default()
        });

        // 1 MB at 1 KB blocks = 1024 blocks, fits
        assert_eq!(runner.effective_block_size(1024 * 1024), 1024);

        // 64 MB at 1 KB blocks = 65536 blocks, doubles once to 2 KB
        assert_eq!(runner.effective_block_size(64 * 1024 * 1024), 2048);

        // 1 GB needs several doublings: 1 GiB / 32768 = 32 KiB
        assert_eq!(runner.effective_block_size(1024 * 1024 * 1024), 32 * 1024);
    }

    #[test]
    fn block_size_respects_configured_slice_limit() {
        let runner = runner_with(Par2Config {
            volume_size: 1024,
            max_input_slices: 100,
            ..Default::default()
        });

        // 1 MB at 1 KB blocks = 1024 blocks > 100, doubles until <= 100:
        // 1024 -> 512 blocks (2K) -> 256 (4K) -> 128 (8K) -> 64 (16K)
        assert_eq!(runner.effective_block_size(1024 * 1024), 16 * 1024);
    }

    #[test]
    fn parpar_is_detected_by_file_stem() {
        let config = Par2Config::default();
        assert!(Par2Runner::with_binary(PathBuf::from("/usr/bin/parpar"), config.clone()).is_parpar());
        assert!(Par2Runner::with_binary(PathBuf::from("ParPar.exe"), config.clone()).is_parpar());
        assert!(!Par2Runner::with_binary(PathBuf::from("/usr/bin/par2"), config).is_parpar());
    }

    #[tokio::test]
    async fn existing_set_is_reused_without_spawn() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.bin");
        std::fs::write(&input, b"data").unwrap();

        std::fs::write(dir.path().join("movie.bin.par2"), b"par2").unwrap();
        std::fs::write(dir.path().join("movie.bin.vol00+01.par2"), b"vol").unwrap();
        std::fs::write(dir.path().join("movie.bin.vol01+02.par2"), b"vol").unwrap();
        std::fs::write(dir.path().join("unrelated.par2"), b"other").unwrap();

        // The binary path does not exist; success proves nothing was spawned
        let runner = runner_with(Par2Config::default());
        let cancel = CancellationToken::new();
        let mut last_percent = 0.0f32;

        let files = runner
            .create(&cancel, &input, dir.path(), |p| last_percent = p)
            .await
            .unwrap();

        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("movie.bin.par2"));
        assert!(files.iter().all(|f| {
            let name = f.file_name().unwrap().to_str().unwrap();
            name.starts_with("movie.bin")
        }));
        assert_eq!(last_percent, 100.0);
    }

    #[tokio::test]
    async fn missing_binary_maps_to_spawn_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.bin");
        std::fs::write(&input, b"data").unwrap();

        let runner = runner_with(Par2Config::default());
        let cancel = CancellationToken::new();

        let err = runner
            .create(&cancel, &input, dir.path(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Par2(Par2Error::Spawn(_))));
    }

    #[tokio::test]
    async fn cancelled_run_kills_a_blocking_process() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.bin");
        std::fs::write(&input, b"data").unwrap();

        // `tail -f` never exits on its own; cancellation must kill it
        let Ok(tail_bin) = which::which("tail") else {
            return;
        };

        let runner = Par2Runner::with_binary(
            tail_bin,
            Par2Config {
                extra_par2_options: vec!["-f".to_string()],
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            cancel_clone.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            runner.create(&cancel, &input, dir.path(), |_| {}),
        )
        .await
        .expect("cancellation must terminate the run");
        assert!(result.is_err());
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let long = "x".repeat(2000);
        assert_eq!(stderr_tail(&long).len(), 512);
        assert_eq!(stderr_tail("short"), "short");
    }
}
