//! Guards for every piece of text that ends up inside generated SQL.
//!
//! Analytics statements are assembled from table names, column names and
//! metadata identifiers. None of these may carry operator- or request-supplied
//! free text into the statement, so each token is checked here before the
//! dialect quotes it:
//! - SQL identifiers (table, column, index names)
//! - metadata UIDs (eleven character, letter first, alphanumeric)
//! - string literals produced internally (dates, regex patterns)

use crate::error::Error;

/// Maximum identifier length accepted by PostgreSQL without truncation.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Length of a metadata UID.
pub const UID_LENGTH: usize = 11;

/// Validate a SQL identifier (table, column, index names).
///
/// Rules:
/// - Must not be empty
/// - At most [`MAX_IDENTIFIER_LENGTH`] characters
/// - Must start with an ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// Mixed case is allowed because dynamic columns are named after UIDs and the
/// dialect always quotes identifiers.
///
/// # Examples
///
/// ```
/// use strata_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("analytics_event_ur1edk5oe2n").is_ok());
/// assert!(validate_sql_identifier("cX5k9anHEHd_name").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("2018").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max {})",
            name.len(),
            MAX_IDENTIFIER_LENGTH
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}

/// Validate a metadata UID: exactly eleven ASCII alphanumeric characters,
/// the first one a letter.
///
/// ```
/// use strata_rdbc::security::validate_uid;
///
/// assert!(validate_uid("IpHINAT79UW").is_ok());
/// assert!(validate_uid("1pHINAT79UW").is_err());
/// assert!(validate_uid("IpHINAT79U'").is_err());
/// ```
pub fn validate_uid(uid: &str) -> crate::Result<()> {
    if uid.len() != UID_LENGTH {
        return Err(Error::config(format!(
            "Invalid UID '{}': expected {} characters, got {}",
            uid,
            UID_LENGTH,
            uid.len()
        )));
    }

    let mut chars = uid.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(Error::config(format!(
            "Invalid UID '{}': must start with a letter",
            uid
        )));
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric()) {
        return Err(Error::config(format!(
            "Invalid UID '{}': contains invalid character '{}'",
            uid, c
        )));
    }

    Ok(())
}

/// Escape a string value for a single-quoted SQL literal.
///
/// Replaces `'` with `''`. Only used for internally produced text such as
/// formatted timestamps and value-type patterns; bind parameters are used
/// wherever the store API allows them.
///
/// ```
/// use strata_rdbc::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("2024-01-01"), "2024-01-01");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}
