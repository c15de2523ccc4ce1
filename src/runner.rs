use chrono::Utc;
use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::classify;
use crate::client::{with_retry, GraphClient};
use crate::error::LookupError;
use crate::input;
use crate::models::{BatchReport, ClassifiedRecord, DirectoryUser, LookupOutcome, UserRecord};

/// Pause between identifiers to stay under upstream rate limits, applied
/// regardless of whether the previous call succeeded.
pub const INTER_RECORD_PAUSE: Duration = Duration::from_millis(150);

/// Emitted after each identifier is recorded; the only way a caller observes
/// in-flight progress.
#[derive(Debug)]
pub struct Progress<'a> {
    pub index: usize,
    pub total: usize,
    pub identifier: &'a str,
}

/// One lookup attempt against the directory. The runner wraps calls in the
/// retry policy; implementations perform a single attempt.
pub trait UserLookup {
    fn lookup_user(
        &self,
        identifier: &str,
    ) -> impl Future<Output = Result<DirectoryUser, LookupError>> + Send;
}

impl UserLookup for GraphClient<'_> {
    async fn lookup_user(&self, identifier: &str) -> Result<DirectoryUser, LookupError> {
        self.fetch_user(identifier).await
    }
}

/// Process the resolved batch strictly in order. A single identifier's
/// failure becomes an Error-status record; the batch always runs to the end.
pub async fn run_batch<L, F>(
    lookup: &L,
    users: &[UserRecord],
    threshold_days: u32,
    mut on_progress: F,
) -> BatchReport
where
    L: UserLookup,
    F: FnMut(&Progress<'_>),
{
    let total = users.len();
    let mut report = BatchReport::default();

    for (index, user) in users.iter().enumerate() {
        let record = process_one(lookup, user, threshold_days).await;
        report.records.push(record);
        on_progress(&Progress {
            index,
            total,
            identifier: &user.identifier,
        });
        if index + 1 < total {
            sleep(INTER_RECORD_PAUSE).await;
        }
    }
    report
}

async fn process_one<L: UserLookup>(
    lookup: &L,
    user: &UserRecord,
    threshold_days: u32,
) -> ClassifiedRecord {
    if !input::is_valid_identifier(&user.identifier) {
        warn!("Skipping lookup for malformed identifier '{}'", user.identifier);
        return error_record(user, &LookupError::InvalidIdentifier, 0);
    }

    let (result, attempts) = with_retry(|| lookup.lookup_user(&user.identifier)).await;
    match result {
        Ok(found) => {
            let enabled = found.is_enabled();
            let last_sign_in = found.last_sign_in();
            let within =
                classify::is_recent(last_sign_in, enabled, threshold_days, Utc::now());
            ClassifiedRecord {
                outcome: LookupOutcome::Success {
                    first_name: found.given_name.unwrap_or_default(),
                    last_name: found.surname.unwrap_or_default(),
                    email: found
                        .user_principal_name
                        .or(found.mail)
                        .unwrap_or_else(|| user.identifier.clone()),
                    account_enabled: enabled,
                    last_sign_in,
                },
                within_threshold: within,
                attempts,
            }
        }
        Err(e) => {
            warn!("Lookup failed for {}: {}", user.identifier, e);
            error_record(user, &e, attempts)
        }
    }
}

/// Error rows keep best-effort display names from the input hints.
fn error_record(user: &UserRecord, error: &LookupError, attempts: u32) -> ClassifiedRecord {
    ClassifiedRecord {
        outcome: LookupOutcome::Error {
            first_name: user
                .first_name_hint
                .clone()
                .unwrap_or_else(|| "Unknown".into()),
            last_name: user
                .last_name_hint
                .clone()
                .unwrap_or_else(|| "Unknown".into()),
            email: user.identifier.clone(),
            detail: format!("{}: {}", error.detail_tag(), error),
        },
        within_threshold: false,
        attempts,
    }
}
