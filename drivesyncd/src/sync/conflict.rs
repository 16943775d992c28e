use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Timestamps within a second of each other count as unchanged; local
/// filesystems and the remote service round modification times differently.
const CLOCK_SLACK_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictCheck {
    pub local_changed: bool,
    pub remote_changed: bool,
}

impl ConflictCheck {
    pub fn both_changed(&self) -> bool {
        self.local_changed && self.remote_changed
    }
}

/// Compares the state captured at the last successful sync against what the
/// file and its remote counterpart look like now.
pub fn detect(
    last_local_mtime_ms: i64,
    current_local_mtime_ms: i64,
    last_remote_modified: &str,
    current_remote_modified: &str,
) -> Option<ConflictCheck> {
    let last_remote = parse_rfc3339_ms(last_remote_modified)?;
    let current_remote = parse_rfc3339_ms(current_remote_modified)?;
    Some(ConflictCheck {
        local_changed: (current_local_mtime_ms - last_local_mtime_ms).abs() > CLOCK_SLACK_MS,
        remote_changed: (current_remote - last_remote).abs() > CLOCK_SLACK_MS,
    })
}

fn parse_rfc3339_ms(value: &str) -> Option<i64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|stamp| (stamp.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Name for the preserved remote copy, e.g.
/// `report (conflict 2024-05-01T10-00-00Z).txt`. Colons are replaced so the
/// name stays legal if the copy is ever downloaded to a local filesystem.
pub fn conflict_name(file_name: &str, stamp: OffsetDateTime) -> String {
    let stamp = stamp.replace_nanosecond(0).unwrap_or(stamp);
    let stamp = stamp
        .format(&Rfc3339)
        .map(|value| value.replace(':', "-"))
        .unwrap_or_else(|_| stamp.unix_timestamp().to_string());
    match file_name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => {
            format!("{base} (conflict {stamp}).{ext}")
        }
        _ => format!("{file_name} (conflict {stamp})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn unchanged_within_slack_is_not_a_conflict() {
        let check = detect(
            1_700_000_000_000,
            1_700_000_000_800,
            "2024-05-01T10:00:00Z",
            "2024-05-01T10:00:00.900Z",
        )
        .unwrap();
        assert!(!check.local_changed);
        assert!(!check.remote_changed);
        assert!(!check.both_changed());
    }

    #[test]
    fn only_local_change_is_not_a_conflict() {
        let check = detect(
            1_700_000_000_000,
            1_700_000_060_000,
            "2024-05-01T10:00:00Z",
            "2024-05-01T10:00:00Z",
        )
        .unwrap();
        assert!(check.local_changed);
        assert!(!check.remote_changed);
        assert!(!check.both_changed());
    }

    #[test]
    fn both_sides_changed_is_a_conflict() {
        let check = detect(
            1_700_000_000_000,
            1_700_000_060_000,
            "2024-05-01T10:00:00Z",
            "2024-05-01T10:05:00Z",
        )
        .unwrap();
        assert!(check.both_changed());
    }

    #[test]
    fn unparseable_remote_stamp_skips_detection() {
        assert!(detect(0, 60_000, "not-a-date", "2024-05-01T10:00:00Z").is_none());
    }

    #[test]
    fn conflict_name_keeps_the_extension() {
        let stamp = datetime!(2024-05-01 10:00:00 UTC);
        assert_eq!(
            conflict_name("report.txt", stamp),
            "report (conflict 2024-05-01T10-00-00Z).txt"
        );
    }

    #[test]
    fn conflict_name_without_extension_appends_the_marker() {
        let stamp = datetime!(2024-05-01 10:00:00 UTC);
        assert_eq!(
            conflict_name("Makefile", stamp),
            "Makefile (conflict 2024-05-01T10-00-00Z)"
        );
    }

    #[test]
    fn dotfile_is_not_treated_as_an_extension() {
        let stamp = datetime!(2024-05-01 10:00:00 UTC);
        assert_eq!(
            conflict_name(".env", stamp),
            ".env (conflict 2024-05-01T10-00-00Z)"
        );
    }
}
