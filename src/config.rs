use std::time::Duration;

use anyhow::Context;

use crate::retry::RetryPolicy;

/// Runtime settings read from the environment (and `.env`, when present).
///
/// | Env Var                    | Default |
/// |----------------------------|---------|
/// | `DATABASE_URL`             | none    |
/// | `DATABASE_MAX_CONNECTIONS` | `5`     |
/// | `STORE_RETRY_ATTEMPTS`     | `4`     |
/// | `STORE_RETRY_BASE_MS`      | `100`   |
/// | `STORE_RETRY_MAX_MS`       | `2000`  |
/// | `TREND_CONFLICT_RETRIES`   | `8`     |
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub retry: RetryPolicy,
    pub conflict_retries: u32,
}

fn parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let max_connections = parsed("DATABASE_MAX_CONNECTIONS", 5u32)?;
        let retry = RetryPolicy {
            max_attempts: parsed("STORE_RETRY_ATTEMPTS", 4u32)?,
            initial_delay: Duration::from_millis(parsed("STORE_RETRY_BASE_MS", 100u64)?),
            max_delay: Duration::from_millis(parsed("STORE_RETRY_MAX_MS", 2_000u64)?),
            ..RetryPolicy::default()
        };
        let conflict_retries = parsed("TREND_CONFLICT_RETRIES", 8u32)?;

        Ok(Self {
            database_url,
            max_connections,
            retry,
            conflict_retries,
        })
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variables_fall_back_to_defaults() {
        assert_eq!(parsed("QUALITY_TRENDS_TEST_UNSET", 17u32).unwrap(), 17);
    }

    #[test]
    fn invalid_values_are_reported() {
        std::env::set_var("QUALITY_TRENDS_TEST_BAD", "many");
        let err = parsed("QUALITY_TRENDS_TEST_BAD", 1u32).unwrap_err();
        assert!(err.to_string().contains("QUALITY_TRENDS_TEST_BAD"));
        std::env::remove_var("QUALITY_TRENDS_TEST_BAD");
    }

    #[test]
    fn database_url_is_only_required_on_demand() {
        let settings = Settings {
            database_url: None,
            max_connections: 5,
            retry: RetryPolicy::default(),
            conflict_retries: 8,
        };
        assert!(settings.require_database_url().is_err());
    }
}
