//! Markup to text conversion through an external converter process.
//!
//! The converter (pandoc by default) is treated as a black box: the raw
//! markup is written to a scoped temporary file, the tool is run against
//! it, and its stdout is normalized. The adapter reports failures and never
//! substitutes content on its own.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Maximum stderr characters carried in a conversion error.
const STDERR_EXCERPT_CHARS: usize = 500;

static TRAILING_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)[ \t]+$").expect("Invalid regex"));

static BLANK_LINE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("Invalid regex"));

/// Converts raw markup into normalized text.
#[async_trait]
pub trait MarkupConverter: Send + Sync {
    async fn convert(&self, raw_markup: &str) -> Result<String>;
}

/// Configuration for the external converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Converter executable, looked up on PATH (`~` is expanded)
    pub program: String,
    /// Arguments placed before the input file path
    pub args: Vec<String>,
    /// Suffix for the temporary input file
    pub input_suffix: String,
    /// Timeout for one conversion in milliseconds
    pub timeout_ms: u64,
    /// Directory for temporary input files (system default when None)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: "pandoc".to_string(),
            args: vec![
                "--from=html".to_string(),
                "--to=gfm".to_string(),
                "--wrap=none".to_string(),
            ],
            input_suffix: ".html".to_string(),
            timeout_ms: 30_000,
            temp_dir: None,
        }
    }
}

impl ConverterConfig {
    /// Use a different converter program and argument list.
    pub fn with_command(
        mut self,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.program = program.into();
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

/// Runs the configured converter as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    config: ConverterConfig,
}

impl CommandConverter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        let program = shellexpand::tilde(&self.config.program);
        which::which(&*program).map_err(|e| {
            Error::conversion_with_source(
                format!("converter binary not found: {}", self.config.program),
                e,
            )
        })
    }

    fn temp_input(&self) -> Result<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder
            .prefix("contextchat-")
            .suffix(&self.config.input_suffix);

        let file = match &self.config.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        file.map_err(|e| Error::conversion_with_source("failed to create temporary input", e))
    }
}

impl Default for CommandConverter {
    fn default() -> Self {
        Self::new(ConverterConfig::default())
    }
}

#[async_trait]
impl MarkupConverter for CommandConverter {
    #[instrument(
        skip(self, raw_markup),
        fields(program = %self.config.program, markup_len = raw_markup.len())
    )]
    async fn convert(&self, raw_markup: &str) -> Result<String> {
        let program = self.resolve_program()?;

        // Removed when dropped, on every return path below.
        let input = self.temp_input()?;
        tokio::fs::write(input.path(), raw_markup)
            .await
            .map_err(|e| Error::conversion_with_source("failed to write temporary input", e))?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .arg(input.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            Error::conversion_with_source(format!("failed to spawn {}", program.display()), e)
        })?;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| Error::conversion_with_source("converter process failed", e))?,
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "Converter timed out");
                return Err(Error::conversion(format!(
                    "converter timed out after {}ms",
                    self.config.timeout_ms
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let mut excerpt: String = stderr.chars().take(STDERR_EXCERPT_CHARS).collect();
            if stderr.chars().count() > STDERR_EXCERPT_CHARS {
                excerpt.push_str("...");
            }
            warn!(status = %output.status, stderr = %excerpt, "Converter exited with error");
            return Err(Error::conversion(format!(
                "converter exited with {}: {}",
                output.status, excerpt
            )));
        }

        let text = normalize_text(&String::from_utf8_lossy(&output.stdout));
        debug!(text_len = text.len(), "Markup converted");
        Ok(text)
    }
}

/// Normalize converter output.
///
/// Line endings become `\n`, trailing whitespace is removed from every line,
/// runs of blank lines collapse to one, and the result is trimmed.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = TRAILING_WHITESPACE.replace_all(&text, "");
    let text = BLANK_LINE_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_text() {
        let raw = "# Sales  \r\n\r\n\r\n\r\nUp 10%\t\n\n\n- east\n- west   \n\n";
        assert_eq!(normalize_text(raw), "# Sales\n\nUp 10%\n\n- east\n- west");
    }

    #[test]
    fn test_normalize_keeps_single_blank_lines() {
        let raw = "Heading\n\nParagraph one.\nStill one.\n\nParagraph two.";
        assert_eq!(normalize_text(raw), raw);
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize_text(" \n\n\t\n"), "");
    }

    #[test]
    fn test_default_config_is_pandoc() {
        let config = ConverterConfig::default();
        assert_eq!(config.program, "pandoc");
        assert_eq!(config.input_suffix, ".html");
        assert_eq!(config.timeout_ms, 30_000);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use pretty_assertions::assert_eq;

        fn converter(dir: &tempfile::TempDir, program: &str, args: &[&str]) -> CommandConverter {
            CommandConverter::new(
                ConverterConfig::default()
                    .with_command(program, args.iter().copied())
                    .with_temp_dir(dir.path())
                    .with_timeout(2_000),
            )
        }

        fn leftover_files(dir: &tempfile::TempDir) -> usize {
            std::fs::read_dir(dir.path()).unwrap().count()
        }

        #[tokio::test]
        async fn test_successful_conversion_is_normalized() {
            let dir = tempfile::tempdir().unwrap();
            let converter = converter(&dir, "cat", &[]);

            let text = converter
                .convert("<h1>Sales</h1>   \n\n\n\n<p>Up 10%</p>\n")
                .await
                .unwrap();

            assert_eq!(text, "<h1>Sales</h1>\n\n<p>Up 10%</p>");
            assert_eq!(leftover_files(&dir), 0);
        }

        #[tokio::test]
        async fn test_nonzero_exit_reports_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let converter = converter(&dir, "sh", &["-c", "echo 'bad markup' >&2; exit 3", "sh"]);

            let err = converter.convert("<p>x</p>").await.unwrap_err();

            assert!(matches!(err, Error::Conversion { .. }));
            assert!(err.to_string().contains("bad markup"), "{err}");
            assert_eq!(leftover_files(&dir), 0);
        }

        #[tokio::test]
        async fn test_missing_binary() {
            let dir = tempfile::tempdir().unwrap();
            let converter = converter(&dir, "contextchat-no-such-converter", &[]);

            let err = converter.convert("<p>x</p>").await.unwrap_err();

            assert!(err.to_string().contains("not found"), "{err}");
            assert_eq!(leftover_files(&dir), 0);
        }

        #[tokio::test]
        async fn test_timeout_is_a_conversion_error() {
            let dir = tempfile::tempdir().unwrap();
            let converter = CommandConverter::new(
                ConverterConfig::default()
                    .with_command("sh", ["-c", "sleep 5", "sh"])
                    .with_temp_dir(dir.path())
                    .with_timeout(100),
            );

            let err = converter.convert("<p>slow</p>").await.unwrap_err();

            assert!(matches!(err, Error::Conversion { .. }));
            assert!(err.to_string().contains("timed out"), "{err}");
            assert_eq!(leftover_files(&dir), 0);
        }
    }
}
