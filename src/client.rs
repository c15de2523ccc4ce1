use log::{debug, warn};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::auth::Session;
use crate::error::LookupError;
use crate::models::{DirectoryUser, GroupList, MemberPage};

/// Maximum attempts for a retryable operation.
pub const RETRY_ATTEMPTS: u32 = 3;
/// Delay before attempt 2 and attempt 3.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(4)];

const USER_SELECT: &str = "givenName,surname,mail,userPrincipalName,accountEnabled";
const ACTIVITY_SELECT: &str = "signInActivity";
const MEMBER_SELECT: &str = "userPrincipalName,mail,accountEnabled";

/// Retry throttled/transient failures with a fixed doubling delay schedule,
/// reporting how many attempts were consumed. Non-retryable errors return
/// immediately.
pub async fn with_retry<T, F, Fut>(mut op: F) -> (Result<T, LookupError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LookupError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return (Ok(value), attempts),
            Err(e) if e.is_retryable() && attempts < RETRY_ATTEMPTS => {
                let delay = RETRY_DELAYS[(attempts - 1) as usize];
                warn!(
                    "Attempt {} failed ({}), retrying in {}s",
                    attempts,
                    e,
                    delay.as_secs()
                );
                sleep(delay).await;
            }
            Err(e) => return (Err(e), attempts),
        }
    }
}

/// Thin authenticated wrapper over the directory API. Borrows the run's
/// session so the client cannot outlive it.
pub struct GraphClient<'s> {
    session: &'s Session,
    base_url: String,
}

impl<'s> GraphClient<'s> {
    pub fn new(session: &'s Session, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        GraphClient {
            session,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch one user's profile and, for enabled accounts only, the sign-in
    /// activity sub-resource. Disabled accounts classify false regardless of
    /// timestamps, so the more expensive activity query is skipped for them.
    pub async fn fetch_user(&self, identifier: &str) -> Result<DirectoryUser, LookupError> {
        let url = format!(
            "{}/v1.0/users/{}?$select={}",
            self.base_url,
            urlencoding::encode(identifier),
            USER_SELECT
        );
        let mut user: DirectoryUser = self.get(&url).await?;

        if user.is_enabled() {
            let url = format!(
                "{}/v1.0/users/{}?$select={}",
                self.base_url,
                urlencoding::encode(identifier),
                ACTIVITY_SELECT
            );
            match self.get::<DirectoryUser>(&url).await {
                Ok(activity) => user.sign_in_activity = activity.sign_in_activity,
                // A 403 here specifically means the audit-log read permission
                // is missing, not directory read in general.
                Err(LookupError::Forbidden(_)) => return Err(LookupError::Forbidden(true)),
                Err(e) => return Err(e),
            }
        } else {
            debug!("{} is disabled, skipping sign-in activity query", identifier);
        }
        Ok(user)
    }

    /// Resolve a group by email (then display name) and return the
    /// identifiers of its enabled user members, in API order.
    pub async fn fetch_group_members(&self, group: &str) -> Result<Vec<String>, LookupError> {
        let (result, _attempts) = with_retry(|| self.fetch_group_members_once(group)).await;
        result
    }

    async fn fetch_group_members_once(&self, group: &str) -> Result<Vec<String>, LookupError> {
        let group_id = self.resolve_group_id(group).await?;
        let mut url = format!(
            "{}/v1.0/groups/{}/members?$select={}&$top=999",
            self.base_url, group_id, MEMBER_SELECT
        );
        let mut members = Vec::new();
        loop {
            let page: MemberPage = self.get(&url).await?;
            for member in &page.value {
                if member.is_enabled_user() {
                    if let Some(id) = member.identifier() {
                        members.push(id.to_string());
                    }
                }
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(members)
    }

    async fn resolve_group_id(&self, group: &str) -> Result<String, LookupError> {
        // exact email match first, exact display-name match as fallback
        for field in ["mail", "displayName"] {
            let filter = format!("{} eq '{}'", field, group.replace('\'', "''"));
            let url = format!(
                "{}/v1.0/groups?$filter={}&$select=id,displayName,mail",
                self.base_url,
                urlencoding::encode(&filter)
            );
            let list: GroupList = self.get(&url).await?;
            if let Some(found) = list.value.into_iter().next() {
                debug!("Group '{}' resolved by {} to {}", group, field, found.id);
                return Ok(found.id);
            }
        }
        Err(LookupError::NotFound)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, LookupError> {
        debug!("GET {}", url);
        let response = self
            .session
            .http()
            .get(url)
            .bearer_auth(self.session.access_token())
            .send()
            .await
            .map_err(|e| LookupError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| LookupError::Transient(format!("malformed response body: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

/// Map an upstream HTTP status to the lookup error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> LookupError {
    match status {
        StatusCode::NOT_FOUND => LookupError::NotFound,
        StatusCode::UNAUTHORIZED => LookupError::Unauthorized,
        StatusCode::FORBIDDEN => LookupError::Forbidden(false),
        StatusCode::TOO_MANY_REQUESTS => LookupError::Throttled,
        _ => {
            let detail: String = body.trim().chars().take(200).collect();
            LookupError::Transient(format!("upstream returned {}: {}", status, detail))
        }
    }
}
