//! Parsing of `systemctl list-units --plain` output.

use serde::Serialize;

/// One systemd unit and its condensed state, as sent to dashboard clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub status: String,
}

/// Build the batched status command for the configured unit patterns.
///
/// `--plain` drops the tree decorations and `--no-pager` the interactive
/// paging, leaving one whitespace-separated row per unit after the header.
pub fn status_command(unit_patterns: &[String]) -> String {
    let patterns = unit_patterns
        .iter()
        .map(|p| format!("'{p}'"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("systemctl list-units {patterns} --all --no-pager --plain")
}

/// Parse `list-units` output into per-service statuses.
///
/// Row layout is `UNIT LOAD ACTIVE SUB [DESCRIPTION...]`; the reported status
/// is columns two through four joined (e.g. `active running Nethermind`).
/// Blank lines are dropped first, then the header row; rows with fewer than
/// three columns (the trailing summary) are skipped.
pub fn parse_service_status(output: &str) -> Vec<ServiceStatus> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let service = fields[0].trim_end_matches(".service");
            let status = fields[2..fields.len().min(5)].join(" ");
            Some(ServiceStatus {
                service: service.to_string(),
                status,
            })
        })
        .collect()
}
