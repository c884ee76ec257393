//! Tenant database provisioning.
//!
//! Creating a database needs elevated credentials and happens before any pool
//! for that database is requested, so it lives behind its own trait rather
//! than the [`ConnectionFactory`](crate::pool::ConnectionFactory).

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::error::{TenancyError, TenancyResult};

/// Postgres identifier length limit (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LEN: usize = 63;

/// Number of tenant id characters kept in a generated database name.
const TENANT_ID_CHARS: usize = 16;

static DATABASE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]*$").expect("static database name pattern")
});

/// Result of a create-database request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Created,
    /// The database was already present. Not an error.
    AlreadyExists,
}

/// Privileged database lifecycle operations.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the physical database.
    async fn create_database(&self, database: &str) -> TenancyResult<ProvisionOutcome>;

    /// Apply the tenant schema to a freshly created (or existing) database.
    async fn initialize_schema(&self, database: &str) -> TenancyResult<()>;

    /// Make sure the registry database, application role and registry schema exist.
    async fn ensure_registry(&self) -> TenancyResult<ProvisionOutcome>;
}

/// Accept only lower-case, unquoted-safe Postgres identifiers.
pub fn validate_database_name(name: &str) -> TenancyResult<()> {
    if name.len() > MAX_IDENTIFIER_LEN || !DATABASE_NAME.is_match(name) {
        return Err(TenancyError::InvalidDatabaseName(name.to_string()));
    }
    Ok(())
}

/// Derive the physical database name for a tenant id.
///
/// `("saas_tenant_", "01HZX3K9Q8M2N4P6R7S8T9V0W1")` → `saas_tenant_01hzx3k9q8m2n4p6`.
pub fn tenant_database_name(prefix: &str, tenant_id: &str) -> TenancyResult<String> {
    let suffix: String = tenant_id
        .chars()
        .take(TENANT_ID_CHARS)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if suffix.is_empty() {
        return Err(TenancyError::InvalidDatabaseName(prefix.to_string()));
    }
    let name = format!("{prefix}{suffix}");
    validate_database_name(&name)?;
    Ok(name)
}

/// Quote an identifier for interpolation into DDL.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for interpolation into DDL that cannot take bind
/// parameters (`CREATE ROLE ... PASSWORD`).
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_database_names() {
        for name in ["saas_dev", "saas_tenant_01hzx3k9", "_scratch", "a"] {
            assert!(validate_database_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_database_names() {
        for name in [
            "",
            "Saas",
            "1tenant",
            "tenant-a",
            "tenant a",
            "tenant\"; DROP DATABASE x; --",
        ] {
            assert_eq!(
                validate_database_name(name),
                Err(TenancyError::InvalidDatabaseName(name.to_string()))
            );
        }
        assert!(validate_database_name(&"a".repeat(64)).is_err());
        assert!(validate_database_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn tenant_database_name_truncates_and_lowercases() {
        let name = tenant_database_name("saas_tenant_", "01HZX3K9Q8M2N4P6R7S8T9V0W1").unwrap();
        assert_eq!(name, "saas_tenant_01hzx3k9q8m2n4p6");
    }

    #[test]
    fn tenant_database_name_maps_punctuation() {
        let name = tenant_database_name("t_", "acme-co.eu").unwrap();
        assert_eq!(name, "t_acme_co_eu");
    }

    #[test]
    fn tenant_database_name_rejects_empty_id() {
        assert!(tenant_database_name("saas_tenant_", "").is_err());
    }

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_identifier("saas_dev"), "\"saas_dev\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("pa'ss"), "'pa''ss'");
    }
}
