use log::{debug, info};
use std::io::Read;
use std::path::Path;

use crate::client::GraphClient;
use crate::error::{AuditError, Result};
use crate::models::UserRecord;

/// Recognized identifier headers, in priority order. Matching is
/// case-sensitive and exact; the first candidate present anywhere in the
/// header row wins.
pub const IDENTIFIER_COLUMNS: [&str; 7] = [
    "Email",
    "EmailAddress",
    "UserPrincipalName",
    "Mail",
    "E-mail",
    "UPN",
    "PrimaryEmail",
];

const FIRST_NAME_COLUMNS: [&str; 4] = ["FirstName", "First Name", "GivenName", "Given Name"];
const LAST_NAME_COLUMNS: [&str; 4] = ["LastName", "Last Name", "Surname", "Sur Name"];

/// Ordered batch of users plus a count of input rows dropped for having a
/// blank identifier.
#[derive(Debug, Default)]
pub struct ResolvedInput {
    pub users: Vec<UserRecord>,
    pub skipped_blank_rows: usize,
}

/// Basic email-shape check applied before any network call: one `@`, a
/// non-empty local part, and a dotted domain.
pub fn is_valid_identifier(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// File mode: parse a delimited table and pull out identifiers and optional
/// name hints, preserving row order.
pub fn resolve_from_file(path: &Path) -> Result<ResolvedInput> {
    if !path.exists() {
        return Err(AuditError::Validation(format!(
            "input file not found: {}",
            path.display()
        )));
    }
    let file = std::fs::File::open(path).map_err(|e| {
        AuditError::Validation(format!("cannot open input file {}: {}", path.display(), e))
    })?;
    let resolved = resolve_from_reader(file)?;
    info!(
        "Resolved {} user(s) from {}",
        resolved.users.len(),
        path.display()
    );
    Ok(resolved)
}

pub(crate) fn resolve_from_reader<R: Read>(reader: R) -> Result<ResolvedInput> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .map_err(|e| AuditError::Validation(format!("cannot read input header row: {}", e)))?
        .clone();

    let id_idx = find_column(&headers, &IDENTIFIER_COLUMNS).ok_or_else(|| {
        AuditError::Validation(format!(
            "no identifier column found; expected one of: {}",
            IDENTIFIER_COLUMNS.join(", ")
        ))
    })?;
    let first_idx = find_column(&headers, &FIRST_NAME_COLUMNS);
    let last_idx = find_column(&headers, &LAST_NAME_COLUMNS);
    debug!(
        "Identifier column: {:?}, name columns: {:?}/{:?}",
        headers.get(id_idx),
        first_idx.and_then(|i| headers.get(i)),
        last_idx.and_then(|i| headers.get(i))
    );

    let mut resolved = ResolvedInput::default();
    for row in csv_reader.records() {
        let row =
            row.map_err(|e| AuditError::Validation(format!("malformed input row: {}", e)))?;
        let identifier = row.get(id_idx).unwrap_or("").trim();
        if identifier.is_empty() {
            resolved.skipped_blank_rows += 1;
            continue;
        }
        resolved.users.push(UserRecord {
            identifier: identifier.to_string(),
            first_name_hint: hint_at(&row, first_idx),
            last_name_hint: hint_at(&row, last_idx),
        });
    }

    if resolved.users.is_empty() {
        return Err(AuditError::Validation(
            "input file contains no usable data rows".into(),
        ));
    }
    Ok(resolved)
}

/// Group mode: one record per enabled user member, API order, no name hints.
pub async fn resolve_from_group(client: &GraphClient<'_>, group: &str) -> Result<ResolvedInput> {
    let members = client
        .fetch_group_members(group)
        .await
        .map_err(|e| AuditError::Group(format!("{}: {}", group, e)))?;
    info!("Resolved {} enabled member(s) from group {}", members.len(), group);
    Ok(ResolvedInput {
        users: members.into_iter().map(UserRecord::bare).collect(),
        skipped_blank_rows: 0,
    })
}

fn find_column(headers: &csv::StringRecord, candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|cand| headers.iter().position(|h| h == *cand))
}

fn hint_at(row: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| row.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_shape_check() {
        assert!(is_valid_identifier("user@example.com"));
        assert!(is_valid_identifier("first.last@sub.example.co.uk"));
        assert!(!is_valid_identifier("no-at-sign"));
        assert!(!is_valid_identifier("@example.com"));
        assert!(!is_valid_identifier("user@nodot"));
        assert!(!is_valid_identifier("user@@example.com"));
        assert!(!is_valid_identifier("user@.com"));
        assert!(!is_valid_identifier("user@example."));
    }

    #[test]
    fn resolves_rows_in_order_with_hints() {
        let data = "Email,First Name,Last Name\na@x.com,Jo,Do\n ,,\nb@x.com,,\n";
        let resolved = resolve_from_reader(data.as_bytes()).unwrap();
        assert_eq!(resolved.users.len(), 2);
        assert_eq!(resolved.skipped_blank_rows, 1);
        assert_eq!(
            resolved.users[0],
            UserRecord {
                identifier: "a@x.com".into(),
                first_name_hint: Some("Jo".into()),
                last_name_hint: Some("Do".into()),
            }
        );
        assert_eq!(resolved.users[1], UserRecord::bare("b@x.com"));
    }

    #[test]
    fn unrecognized_header_is_a_schema_error() {
        let err = resolve_from_reader("Username\njdoe\n".as_bytes()).unwrap_err();
        match err {
            AuditError::Validation(msg) => assert!(msg.contains("no identifier column")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn header_match_is_case_sensitive() {
        let err = resolve_from_reader("email\na@x.com\n".as_bytes()).unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
    }

    #[test]
    fn first_candidate_in_priority_order_wins() {
        // UPN column comes first positionally, but Email outranks it.
        let data = "UPN,Email\nupn@x.com,mail@x.com\n";
        let resolved = resolve_from_reader(data.as_bytes()).unwrap();
        assert_eq!(resolved.users[0].identifier, "mail@x.com");
    }

    #[test]
    fn quoted_fields_with_embedded_delimiters_parse() {
        let data = "Email,First Name,Last Name\n\"a@x.com\",\"Jo, Jr.\",\"O'Do\"\n";
        let resolved = resolve_from_reader(data.as_bytes()).unwrap();
        assert_eq!(resolved.users[0].identifier, "a@x.com");
        assert_eq!(resolved.users[0].first_name_hint.as_deref(), Some("Jo, Jr."));
        assert_eq!(resolved.users[0].last_name_hint.as_deref(), Some("O'Do"));
    }

    #[test]
    fn header_only_file_is_rejected() {
        let err = resolve_from_reader("Email\n".as_bytes()).unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
    }

    #[test]
    fn missing_file_is_rejected_before_any_call() {
        let err = resolve_from_file(Path::new("/nonexistent/users.csv")).unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
    }
}
