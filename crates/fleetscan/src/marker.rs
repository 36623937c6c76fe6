// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion marker protocol.
//!
//! Workers communicate their state via a status file at [`MARKER_PATH`].
//! A missing marker means the worker has not started yet.

use serde::{Deserialize, Serialize};

/// Root directory of the worker on each instance.
pub const REMOTE_ROOT: &str = "/opt/fleetscan";

/// Well-known location of the status marker.
pub const MARKER_PATH: &str = "/opt/fleetscan/status";

/// Directory the worker writes its output files into.
pub const REMOTE_OUTPUT_DIR: &str = "/opt/fleetscan/output";

/// Worker status as reported by the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerStatus {
    /// Worker is extracting
    Running,
    /// Worker finished and its output is ready
    Completed,
    /// Worker exited with an error
    Failed,
}

impl MarkerStatus {
    /// Parse marker content.
    ///
    /// Matches a status word anywhere in the content so timestamped lines
    /// such as `2024-01-01T00:00:00 - COMPLETED - done` are understood.
    /// Terminal words win over RUNNING. Returns `None` for empty or
    /// unrecognised content.
    pub fn parse(content: &str) -> Option<Self> {
        let words: Vec<String> = content
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_ascii_uppercase())
            .collect();

        if words.iter().any(|w| w == "FAILED") {
            Some(Self::Failed)
        } else if words.iter().any(|w| w == "COMPLETED") {
            Some(Self::Completed)
        } else if words.iter().any(|w| w == "RUNNING" || w == "STARTED") {
            Some(Self::Running)
        } else {
            None
        }
    }

    /// Wire form of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        assert_eq!(MarkerStatus::parse("COMPLETED\n"), Some(MarkerStatus::Completed));
        assert_eq!(MarkerStatus::parse("RUNNING"), Some(MarkerStatus::Running));
        assert_eq!(MarkerStatus::parse("failed"), Some(MarkerStatus::Failed));
    }

    #[test]
    fn test_parse_timestamped_line() {
        let line = "2024-01-01T10:00:00.123 - COMPLETED - wrote 3 files";
        assert_eq!(MarkerStatus::parse(line), Some(MarkerStatus::Completed));
    }

    #[test]
    fn test_parse_empty_is_none() {
        assert_eq!(MarkerStatus::parse(""), None);
        assert_eq!(MarkerStatus::parse("   \n"), None);
        assert_eq!(MarkerStatus::parse("cat: no such file"), None);
    }

    #[test]
    fn test_parse_ignores_substrings() {
        assert_eq!(MarkerStatus::parse("UNCOMPLETEDNESS"), None);
    }
}
