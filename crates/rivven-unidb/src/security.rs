//! Identifier validation and credential redaction.
//!
//! Introspection templates such as `PRAGMA table_info(<table>)` and
//! `DESCRIBE <table>` cannot be parameterized, so the table name is checked
//! with [`validate_sql_identifier`] before it is spliced in.

use crate::error::Error;

/// Marker rendered in place of any credential value
pub const REDACTED: &str = "***REDACTED***";

/// Key fragments whose values are treated as credentials
const SENSITIVE_KEYS: &[&str] = &["password", "passwd", "secret", "token", "api_key"];

/// Whether an option or query parameter name denotes a credential
pub(crate) fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| lower.contains(s))
}

/// Validate a SQL identifier (table name) for safe interpolation.
///
/// - Must not be empty
/// - Maximum 255 characters
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use rivven_unidb::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("users").is_ok());
/// assert!(validate_sql_identifier("_private_2").is_ok());
///
/// assert!(validate_sql_identifier("x); DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("1abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 255 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 255)",
            name.len()
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

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Replace the password component of a connection URL with `***`.
///
/// Query parameters whose name denotes a credential (`password`, `token`,
/// `sslpassword`, ...) are masked the same way. Unparseable input is
/// redacted entirely, since it may still hold a secret.
///
/// ```
/// use rivven_unidb::security::redact_url;
///
/// assert_eq!(
///     redact_url("postgres://app:s3cret@db:5432/main"),
///     "postgres://app:***@db:5432/main"
/// );
/// assert_eq!(redact_url("mysql://db/main"), "mysql://db/main");
/// assert_eq!(
///     redact_url("postgres://db/main?user=app&password=s3cret"),
///     "postgres://db/main?user=app&password=***"
/// );
/// ```
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            if parsed.query_pairs().any(|(k, _)| is_sensitive_key(&k)) {
                let pairs: Vec<(String, String)> = parsed
                    .query_pairs()
                    .map(|(k, v)| {
                        let v = if is_sensitive_key(&k) {
                            "***".to_string()
                        } else {
                            v.into_owned()
                        };
                        (k.into_owned(), v)
                    })
                    .collect();
                parsed.query_pairs_mut().clear().extend_pairs(pairs);
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_limits() {
        assert!(validate_sql_identifier(&"a".repeat(255)).is_ok());
        assert!(validate_sql_identifier(&"a".repeat(256)).is_err());
        assert!(validate_sql_identifier("with space").is_err());
        assert!(validate_sql_identifier("schema.table").is_err());
    }

    #[test]
    fn test_redact_url_without_password() {
        assert_eq!(
            redact_url("mongodb://localhost:27017/test"),
            "mongodb://localhost:27017/test"
        );
        assert_eq!(redact_url("not a url"), "***");
    }

    #[test]
    fn test_redact_url_query_credentials() {
        let redacted = redact_url(
            "postgres://db.internal/shop?user=app&password=hunter2&sslpassword=hunter3&API_TOKEN=t0k",
        );
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("hunter3"));
        assert!(!redacted.contains("t0k"));
        assert!(redacted.contains("user=app"));
        assert!(redacted.contains("password=***"));
        assert!(redacted.contains("sslpassword=***"));

        assert_eq!(
            redact_url("sqlite:///tmp/app.db?mode=ro"),
            "sqlite:///tmp/app.db?mode=ro"
        );
    }

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive_key("Password"));
        assert!(is_sensitive_key("db_secret"));
        assert!(is_sensitive_key("api_key"));
        assert!(!is_sensitive_key("sslmode"));
        assert!(!is_sensitive_key("user"));
    }
}
