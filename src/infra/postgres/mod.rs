//! PostgreSQL implementations for the production warehouse
//!
//! Uses native `TIMESTAMPTZ[]` / `TEXT[]` arrays and `JSONB` event parameters.
//! The configured dataset maps to a schema on the connection's `search_path`.

mod event_source;
mod identity_store;

pub use event_source::*;
pub use identity_store::*;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;

use crate::infra::{IdentityError, Result};

/// Check that a dataset name is usable as an unquoted schema identifier
pub fn validate_schema_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(())
    } else {
        Err(IdentityError::Configuration(format!(
            "dataset id {name:?} is not a valid schema name"
        )))
    }
}

/// Open a PostgreSQL pool.
///
/// When `schema` is set, every connection creates it if missing and puts it
/// first on the `search_path`.
pub async fn connect_postgres(
    url: &str,
    max_connections: u32,
    schema: Option<&str>,
) -> Result<PgPool> {
    let mut options = PgPoolOptions::new().max_connections(max_connections.max(1));

    if let Some(schema) = schema {
        validate_schema_name(schema)?;
        let create = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
        let search_path = format!("SET search_path TO {schema}, public");

        options = options.after_connect(move |conn, _meta| {
            let create = create.clone();
            let search_path = search_path.clone();
            Box::pin(async move {
                conn.execute(create.as_str()).await?;
                conn.execute(search_path.as_str()).await?;
                Ok(())
            })
        });
    }

    let pool = options.connect(url).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_name_validation() {
        assert!(validate_schema_name("analytics_123").is_ok());
        assert!(validate_schema_name("_staging").is_ok());
        assert!(validate_schema_name("").is_err());
        assert!(validate_schema_name("1dataset").is_err());
        assert!(validate_schema_name("data-set").is_err());
        assert!(validate_schema_name("x; DROP TABLE identity_match").is_err());
    }
}
