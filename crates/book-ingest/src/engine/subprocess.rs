//! Out-of-process parsing engine
//!
//! Runs the configured command as
//! `<command> [args..] --input <pdf> --language <tag> [--ocr]` and expects the
//! exchange schema as JSON on stdout. Non-zero exit, timeout and malformed
//! output all become `EngineError`; only a short stderr tail is kept.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::{EngineOptions, ParsingEngine};
use crate::config::EngineConfig;
use crate::error::{truncate, Error, Result};
use crate::types::ParsedDocument;

const STDERR_TAIL_LEN: usize = 200;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsing engine running as a child process
pub struct SubprocessEngine {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    version: String,
}

impl SubprocessEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            version: config.version.clone(),
        }
    }

    fn build_command(&self, pdf_path: &Path, options: &EngineOptions) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--input")
            .arg(pdf_path)
            .arg("--language")
            .arg(&options.language);
        if options.ocr_enabled {
            cmd.arg("--ocr");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the parse future (timeout or cancellation) kills the engine
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ParsingEngine for SubprocessEngine {
    fn name(&self) -> &str {
        "subprocess"
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn parse(&self, pdf_path: &Path, options: &EngineOptions) -> Result<ParsedDocument> {
        let start = std::time::Instant::now();
        let child = self
            .build_command(pdf_path, options)
            .spawn()
            .map_err(|e| Error::engine(format!("failed to start '{}': {}", self.command, e)))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| Error::engine(format!("failed waiting for '{}': {}", self.command, e)))?,
            Err(_) => {
                tracing::error!(
                    "TIMEOUT parsing {} after {:.1}s (limit: {}s)",
                    pdf_path.display(),
                    start.elapsed().as_secs_f64(),
                    self.timeout.as_secs()
                );
                return Err(Error::engine(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                "Engine '{}' failed on {} ({}):\n{}",
                self.command,
                pdf_path.display(),
                output.status,
                stderr
            );
            return Err(Error::engine(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr_tail(&stderr)
            )));
        }

        let doc: ParsedDocument = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::engine(format!("malformed engine output: {}", e)))?;

        tracing::info!(
            "Engine '{}' parsed {} in {:.1}s: {} pages, {} blocks, {} assets",
            self.command,
            pdf_path.display(),
            start.elapsed().as_secs_f64(),
            doc.pages.len(),
            doc.blocks.len(),
            doc.assets.len()
        );
        Ok(doc)
    }

    async fn health_check(&self) -> Result<bool> {
        let child = Command::new(&self.command)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match timeout(HEALTH_CHECK_TIMEOUT, child).await {
            Ok(Ok(status)) => Ok(status.success()),
            _ => Ok(false),
        }
    }
}

/// Last non-empty stderr line, bounded
fn stderr_tail(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no diagnostic output");
    truncate(line, STDERR_TAIL_LEN)
}
