use chrono::Utc;
use log::{info, warn};
use std::path::{Path, PathBuf};

use crate::error::ReportError;
use crate::models::{BatchReport, LookupOutcome};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const SIGN_IN_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Export the report as CSV, returning the path actually written.
///
/// An existing file at `path` is first copied aside with a timestamped
/// `_backup_` suffix (best-effort). If the primary destination cannot be
/// written, one fallback into the system temp directory is attempted and the
/// alternate path is returned; if that also fails, both failures surface.
pub fn write_report(
    report: &BatchReport,
    threshold_days: u32,
    path: &Path,
) -> Result<PathBuf, ReportError> {
    write_with_fallback_dir(report, threshold_days, path, &std::env::temp_dir())
}

fn write_with_fallback_dir(
    report: &BatchReport,
    threshold_days: u32,
    path: &Path,
    fallback_dir: &Path,
) -> Result<PathBuf, ReportError> {
    if path.exists() {
        backup_existing(path);
    }

    match write_rows(report, threshold_days, path) {
        Ok(()) => Ok(path.to_path_buf()),
        Err(primary) => {
            let fallback = fallback_path(path, fallback_dir);
            warn!(
                "Cannot write report to {} ({}), trying {}",
                path.display(),
                primary,
                fallback.display()
            );
            match write_rows(report, threshold_days, &fallback) {
                Ok(()) => Ok(fallback),
                Err(secondary) => Err(ReportError::FallbackFailed {
                    primary_path: path.to_path_buf(),
                    primary: primary.to_string(),
                    fallback_path: fallback,
                    fallback: secondary.to_string(),
                }),
            }
        }
    }
}

/// Column label for the within-threshold flag; computed only here so the
/// internal model stays threshold-agnostic.
pub fn within_column_label(threshold_days: u32) -> String {
    format!("SignedInLast{}Days", threshold_days)
}

fn write_rows(
    report: &BatchReport,
    threshold_days: u32,
    path: &Path,
) -> Result<(), ReportError> {
    let to_error = |source: csv::Error| ReportError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::Writer::from_path(path).map_err(to_error)?;
    writer
        .write_record([
            "FirstName",
            "LastName",
            "EmailAddress",
            "LastSignInDateTime",
            &within_column_label(threshold_days),
            "Details",
        ])
        .map_err(to_error)?;

    for record in &report.records {
        let (first, last, email, sign_in, details) = match &record.outcome {
            LookupOutcome::Success {
                first_name: first,
                last_name: last,
                email,
                account_enabled,
                last_sign_in,
            } => {
                let rendered = if !account_enabled {
                    "Account Disabled".to_string()
                } else if let Some(t) = last_sign_in {
                    t.format(SIGN_IN_FORMAT).to_string()
                } else {
                    "Never".to_string()
                };
                (first, last, email, rendered, String::new())
            }
            LookupOutcome::Error {
                first_name: first,
                last_name: last,
                email,
                detail,
            } => (first, last, email, "Error".to_string(), detail.clone()),
        };
        writer
            .write_record([
                first.as_str(),
                last.as_str(),
                email.as_str(),
                &sign_in,
                if record.within_threshold { "Yes" } else { "No" },
                &details,
            ])
            .map_err(to_error)?;
    }
    writer
        .flush()
        .map_err(|e| to_error(csv::Error::from(e)))?;
    Ok(())
}

/// Copy the existing file aside. Failure only warns: losing the backup must
/// not block the new report.
fn backup_existing(path: &Path) {
    let backup = sibling_with_suffix(path, &format!("_backup_{}", timestamp_suffix()));
    match std::fs::copy(path, &backup) {
        Ok(_) => info!(
            "Existing report backed up to {}",
            backup.display()
        ),
        Err(e) => warn!(
            "Could not back up existing report {}: {}",
            path.display(),
            e
        ),
    }
}

fn fallback_path(path: &Path, fallback_dir: &Path) -> PathBuf {
    let name = sibling_with_suffix(path, &format!("_{}", timestamp_suffix()));
    let file_name = name
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("signin_report_{}.csv", timestamp_suffix())));
    fallback_dir.join(file_name)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("report");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    path.with_file_name(format!("{}{}.{}", stem, suffix, ext))
}

fn timestamp_suffix() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClassifiedRecord;
    use chrono::TimeZone;

    fn sample_report() -> BatchReport {
        BatchReport {
            records: vec![
                ClassifiedRecord {
                    outcome: LookupOutcome::Success {
                        first_name: "Ada".into(),
                        last_name: "Lovelace".into(),
                        email: "ada@x.com".into(),
                        account_enabled: true,
                        last_sign_in: Some(
                            Utc.with_ymd_and_hms(2026, 8, 20, 9, 15, 0).unwrap(),
                        ),
                    },
                    within_threshold: true,
                    attempts: 1,
                },
                ClassifiedRecord {
                    outcome: LookupOutcome::Success {
                        first_name: "Nev".into(),
                        last_name: "Er".into(),
                        email: "never@x.com".into(),
                        account_enabled: true,
                        last_sign_in: None,
                    },
                    within_threshold: false,
                    attempts: 1,
                },
                ClassifiedRecord {
                    outcome: LookupOutcome::Success {
                        first_name: "Dis".into(),
                        last_name: "Abled".into(),
                        email: "disabled@x.com".into(),
                        account_enabled: false,
                        last_sign_in: None,
                    },
                    within_threshold: false,
                    attempts: 1,
                },
                ClassifiedRecord {
                    outcome: LookupOutcome::Error {
                        first_name: "Unknown".into(),
                        last_name: "Unknown".into(),
                        email: "gone@x.com".into(),
                        detail: "UserNotFound: no directory account matches this identifier"
                            .into(),
                    },
                    within_threshold: false,
                    attempts: 1,
                },
            ],
            skipped_blank_rows: 0,
        }
    }

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn writes_fixed_columns_and_renderings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");

        let written = write_report(&sample_report(), 14, &path).unwrap();
        assert_eq!(written, path);

        let rows = read_rows(&path);
        assert_eq!(
            rows[0],
            vec![
                "FirstName",
                "LastName",
                "EmailAddress",
                "LastSignInDateTime",
                "SignedInLast14Days",
                "Details"
            ]
        );
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[1][3], "2026-08-20 09:15:00");
        assert_eq!(rows[1][4], "Yes");
        assert_eq!(rows[2][3], "Never");
        assert_eq!(rows[2][4], "No");
        assert_eq!(rows[3][3], "Account Disabled");
        assert_eq!(rows[4][3], "Error");
        assert!(rows[4][5].starts_with("UserNotFound:"));
    }

    #[test]
    fn existing_report_is_backed_up_before_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, "old contents\n").unwrap();

        write_report(&sample_report(), 30, &path).unwrap();

        let backups: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("report_backup_"))
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&backups[0]).unwrap(),
            "old contents\n"
        );
        // new file replaced the old contents
        let rows = read_rows(&path);
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn double_write_failure_carries_both_error_details() {
        let primary = Path::new("/nonexistent-dir/sub/report.csv");
        let fallback_dir = Path::new("/also-nonexistent-dir");

        let err =
            write_with_fallback_dir(&sample_report(), 30, primary, fallback_dir).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("/nonexistent-dir/sub/report.csv"));
        assert!(message.contains("/also-nonexistent-dir"));
        match err {
            ReportError::FallbackFailed {
                primary_path,
                primary,
                fallback_path,
                fallback,
            } => {
                assert_eq!(primary_path, PathBuf::from("/nonexistent-dir/sub/report.csv"));
                assert!(fallback_path.starts_with(fallback_dir));
                assert!(!primary.is_empty());
                assert!(!fallback.is_empty());
            }
            other => panic!("expected FallbackFailed, got {:?}", other),
        }
    }

    #[test]
    fn unwritable_destination_falls_back_to_temp_dir() {
        let primary = Path::new("/nonexistent-dir/sub/report.csv");

        let written = write_report(&sample_report(), 30, primary).unwrap();

        assert_ne!(written, primary);
        assert!(written.starts_with(std::env::temp_dir()));
        let rows = read_rows(&written);
        assert_eq!(rows.len(), 5);
        std::fs::remove_file(written).ok();
    }
}
