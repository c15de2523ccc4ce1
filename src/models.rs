use chrono::{DateTime, Utc};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Directory API wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub mail: Option<String>,
    pub user_principal_name: Option<String>,
    pub account_enabled: Option<bool>,
    pub sign_in_activity: Option<SignInActivity>,
}

impl DirectoryUser {
    pub fn is_enabled(&self) -> bool {
        self.account_enabled.unwrap_or(false)
    }

    pub fn last_sign_in(&self) -> Option<DateTime<Utc>> {
        self.sign_in_activity
            .as_ref()
            .and_then(|a| a.last_sign_in_date_time)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInActivity {
    pub last_sign_in_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct GroupList {
    pub value: Vec<DirectoryGroup>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryGroup {
    pub id: String,
    pub display_name: Option<String>,
    pub mail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemberPage {
    pub value: Vec<GroupMember>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    #[serde(rename = "@odata.type", default)]
    pub odata_type: Option<String>,
    pub user_principal_name: Option<String>,
    pub mail: Option<String>,
    pub account_enabled: Option<bool>,
}

impl GroupMember {
    /// Membership listings mix users, devices and nested groups; only enabled
    /// user objects are audited.
    pub fn is_enabled_user(&self) -> bool {
        self.odata_type.as_deref() == Some("#microsoft.graph.user")
            && self.account_enabled.unwrap_or(false)
    }

    pub fn identifier(&self) -> Option<&str> {
        self.user_principal_name
            .as_deref()
            .or(self.mail.as_deref())
            .filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Domain model
// ---------------------------------------------------------------------------

/// One row of resolved input: who to look up, plus optional display-name
/// fallbacks taken from the input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub identifier: String,
    pub first_name_hint: Option<String>,
    pub last_name_hint: Option<String>,
}

impl UserRecord {
    pub fn bare(identifier: impl Into<String>) -> Self {
        UserRecord {
            identifier: identifier.into(),
            first_name_hint: None,
            last_name_hint: None,
        }
    }
}

/// Result of one user lookup. Error rows still carry best-effort display
/// fields so the report stays readable.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Success {
        first_name: String,
        last_name: String,
        email: String,
        account_enabled: bool,
        last_sign_in: Option<DateTime<Utc>>,
    },
    Error {
        first_name: String,
        last_name: String,
        email: String,
        detail: String,
    },
}

impl LookupOutcome {
    pub fn email(&self) -> &str {
        match self {
            LookupOutcome::Success { email, .. } | LookupOutcome::Error { email, .. } => email,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LookupOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRecord {
    pub outcome: LookupOutcome,
    pub within_threshold: bool,
    /// API attempts consumed for this identifier, including retries.
    /// Zero when the identifier was rejected before any call.
    pub attempts: u32,
}

/// Accumulated output of one batch run. Summary counts are derived on demand
/// rather than stored.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub records: Vec<ClassifiedRecord>,
    pub skipped_blank_rows: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn success_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome.is_success())
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.total() - self.success_count()
    }

    pub fn within_count(&self) -> usize {
        self.records.iter().filter(|r| r.within_threshold).count()
    }

    pub fn outside_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome.is_success() && !r.within_threshold)
            .count()
    }
}
