use anyhow::Result;

use crate::output::{EventLine, TokenStatus};

pub fn format_status(status: &TokenStatus) -> Result<String> {
    Ok(serde_json::to_string_pretty(status)?)
}

/// One compact object per line so `watch --json` output can be streamed.
pub fn format_event(line: &EventLine) -> Result<String> {
    Ok(serde_json::to_string(line)?)
}
