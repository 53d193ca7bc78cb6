// SPDX-License-Identifier: AGPL-3.0-or-later
//! rsync `--stats` parsing

use super::SyncResult;

/// Pull the transfer counters out of `rsync --stats` output.
///
/// Handles both the modern "Number of regular files transferred" line and the
/// older "Number of files transferred", and thousands separators.
pub fn parse_rsync_stats(output: &str) -> SyncResult {
    let mut result = SyncResult::default();

    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim();
        if label == "Number of regular files transferred" || label == "Number of files transferred" {
            result.files_transferred = leading_number(value);
        } else if label == "Total transferred file size" {
            result.bytes_transferred = leading_number(value);
        }
    }

    result
}

fn leading_number(value: &str) -> u64 {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}
