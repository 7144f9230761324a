//! Engine output protocol.
//!
//! A `convert` engine must emit a JSON object `{"files": [{"path", "content"}]}`
//! on stdout, optionally surrounded by commentary. The largest well-formed
//! top-level JSON object in the stream is extracted before parsing.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// One file produced by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Parsed engine output for a convert task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub files: Vec<FileEntry>,
}

/// Judge verdict emitted by the arbitration judge engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub winner_engine: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

/// Parse engine stdout into an [`EngineOutput`], tolerating surrounding
/// non-JSON commentary. Rejects output whose shape is invalid.
pub fn parse_engine_output(stdout: &str) -> Result<EngineOutput> {
    let candidate = extract_json_object(stdout)
        .ok_or_else(|| anyhow!("engine output contains no JSON object"))?;
    let output: EngineOutput =
        serde_json::from_str(candidate).context("engine output does not match files protocol")?;
    for entry in &output.files {
        if entry.path.trim().is_empty() {
            return Err(anyhow!("engine output contains a file entry with empty path"));
        }
    }
    Ok(output)
}

/// Parse judge stdout into a [`JudgeVerdict`], same extraction rules.
pub fn parse_judge_verdict(stdout: &str) -> Result<JudgeVerdict> {
    let candidate = extract_json_object(stdout)
        .ok_or_else(|| anyhow!("judge output contains no JSON object"))?;
    serde_json::from_str(candidate).context("judge output does not match verdict protocol")
}

/// Find the largest balanced top-level `{...}` span in `text`, skipping
/// braces inside JSON string literals.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;

    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let span = (start, i + 1);
                        let longer = best.is_none_or(|(s, e)| span.1 - span.0 > e - s);
                        if longer {
                            best = Some(span);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(s, e)| &text[s..e])
}
