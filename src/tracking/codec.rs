//! Tracking section codec
//!
//! The tracking section lives inside the work item body between two HTML
//! comment markers. It holds a rendered status table for humans and a single
//! `state` comment carrying the JSON form of the block, which is the only part
//! read back by [`decode`]. Everything outside the markers belongs to humans
//! and is never touched.

use super::model::{StepStatus, TrackingBlock};
use crate::observability::metrics::metrics;
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::ops::Range;
use thiserror::Error;
use tracing::warn;

pub const SECTION_BEGIN: &str = "<!-- agent-pipeline:begin -->";
pub const SECTION_END: &str = "<!-- agent-pipeline:end -->";
const STATE_PREFIX: &str = "<!-- agent-pipeline:state ";
const COMMENT_END: &str = "-->";

/// Malformed tracking section
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("tracking section has no state line")]
    MissingState,
    #[error("tracking state line is not terminated")]
    Unterminated,
    #[error("tracking state is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("tracking state is inconsistent: {0}")]
    Inconsistent(String),
}

/// Render a block as a tracking section.
///
/// Output depends only on the block, so encoding an unchanged block always
/// yields the same bytes.
pub fn encode(block: &TrackingBlock) -> String {
    let mut out = String::new();
    out.push_str(SECTION_BEGIN);
    out.push('\n');
    let _ = writeln!(out, "### Agent pipeline: {}", block.status);

    if !block.steps.is_empty() {
        out.push('\n');
        out.push_str("| # | Agent | Status | Started | Completed | Output |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for step in &block.steps {
            let output = match (&step.status, &step.failure_reason) {
                (StepStatus::Failed, Some(reason)) => format!("failed: {reason}"),
                _ => step.output_ref.clone().unwrap_or_default(),
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                step.position,
                table_cell(&step.agent),
                step.status,
                format_time(step.started_at),
                format_time(step.completed_at),
                table_cell(&output),
            );
        }
    }

    if !block.effects.is_empty() {
        out.push_str("\nApplied changes:\n");
        for effect in &block.effects {
            let _ = writeln!(
                out,
                "- {} ({}): {}",
                effect.kind,
                format_time(Some(effect.applied_at)),
                table_cell(&effect.summary),
            );
        }
    }

    if !block.pending_proposals.is_empty() {
        out.push_str("\nAwaiting confirmation:\n");
        for proposal in &block.pending_proposals {
            let _ = writeln!(
                out,
                "- {} ({}) `{}`",
                table_cell(&proposal.kind),
                format_time(Some(proposal.created_at)),
                proposal.id,
            );
        }
    }

    out.push('\n');
    out.push_str(STATE_PREFIX);
    out.push_str(&state_json(block));
    out.push(' ');
    out.push_str(COMMENT_END);
    out.push('\n');
    out.push_str(SECTION_END);
    out
}

/// Decode the tracking section of a body.
///
/// A body without a section decodes to an empty block. A section whose state
/// line is missing or unreadable is a [`DecodeError`].
pub fn decode(text: &str) -> Result<TrackingBlock, DecodeError> {
    let Some(range) = find_section(text) else {
        return Ok(TrackingBlock::empty());
    };

    let section = &text[range];
    let state = section
        .lines()
        .find_map(|line| line.trim().strip_prefix(STATE_PREFIX))
        .ok_or(DecodeError::MissingState)?;
    let json = state
        .trim_end()
        .strip_suffix(COMMENT_END)
        .ok_or(DecodeError::Unterminated)?;

    let block: TrackingBlock = serde_json::from_str(json.trim())?;
    check_consistency(&block)?;
    Ok(block)
}

/// Decode, treating a malformed section as an empty block
pub fn decode_or_empty(text: &str) -> TrackingBlock {
    match decode(text) {
        Ok(block) => block,
        Err(e) => {
            warn!(error = %e, "Malformed tracking section, treating as empty");
            metrics().decode_error();
            TrackingBlock::empty()
        }
    }
}

/// Replace the tracking section of `body` with `block`, or append one.
///
/// Text outside the section is preserved byte for byte.
pub fn render_into(body: &str, block: &TrackingBlock) -> String {
    let section = encode(block);
    match find_section(body) {
        Some(range) => {
            let mut out = String::with_capacity(body.len() + section.len());
            out.push_str(&body[..range.start]);
            out.push_str(&section);
            out.push_str(&body[range.end..]);
            out
        }
        None if body.is_empty() => section,
        None => {
            let separator = if body.ends_with("\n\n") {
                ""
            } else if body.ends_with('\n') {
                "\n"
            } else {
                "\n\n"
            };
            format!("{body}{separator}{section}")
        }
    }
}

/// Body text with the tracking section removed
pub fn strip_section(body: &str) -> String {
    match find_section(body) {
        Some(range) => {
            let before = body[..range.start].trim_end();
            let after = body[range.end..].trim_start();
            match (before.is_empty(), after.is_empty()) {
                (true, _) => after.to_string(),
                (false, true) => before.to_string(),
                (false, false) => format!("{before}\n\n{after}"),
            }
        }
        None => body.to_string(),
    }
}

/// Byte range of the tracking section, markers included.
///
/// Anchored on the first end marker and the last begin marker before it, so
/// a stray begin marker left in human text does not swallow that text.
pub fn find_section(body: &str) -> Option<Range<usize>> {
    let end_start = body.find(SECTION_END)?;
    let begin = body[..end_start].rfind(SECTION_BEGIN)?;
    Some(begin..end_start + SECTION_END.len())
}

/// JSON form of the block with `<` and `>` escaped so it can never close the
/// surrounding comment. Both only occur inside JSON strings, where the
/// `\u003c` / `\u003e` escapes decode back to the original characters.
fn state_json(block: &TrackingBlock) -> String {
    serde_json::to_string(block)
        .expect("tracking block has string keys and always serializes")
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
}

fn check_consistency(block: &TrackingBlock) -> Result<(), DecodeError> {
    let in_progress = block.in_progress_count();
    if in_progress > 1 {
        return Err(DecodeError::Inconsistent(format!(
            "{in_progress} steps are in_progress"
        )));
    }

    for pair in block.steps.windows(2) {
        if pair[0].position >= pair[1].position {
            return Err(DecodeError::Inconsistent(format!(
                "step positions {} and {} are out of order",
                pair[0].position, pair[1].position
            )));
        }
    }

    Ok(())
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_default()
}

/// Table text is escaped so it cannot contain section markers or break rows
fn table_cell(text: &str) -> String {
    text.replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('|', "\\|")
        .replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
}
