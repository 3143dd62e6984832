use std::{collections::HashMap, env, time::Duration};

use thiserror::Error;

/// Every problem found while reading the environment, reported together.
#[derive(Debug, Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub api_token: String,
    pub evolution_api_url: String,
    pub evolution_api_key: String,
    pub evolution_timeout: Duration,
    /// Supabase project the database belongs to, when deployed there.
    pub supabase_url: Option<String>,
    pub queue: QueueConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup so validation can be exercised
    /// without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut problems = Vec::new();

        let port = parse_positive(&get, "PORT", 4000u16, &mut problems);

        let database_url = get("DATABASE_URL")
            .or_else(|| get("SUPABASE_DB_URL"))
            .unwrap_or_else(|| {
                problems.push("DATABASE_URL (or SUPABASE_DB_URL) is required".to_string());
                String::new()
            });

        let api_token = get("API_TOKEN")
            .or_else(|| get("SUPABASE_SERVICE_ROLE_KEY"))
            .unwrap_or_else(|| {
                problems.push("API_TOKEN (or SUPABASE_SERVICE_ROLE_KEY) is required".to_string());
                String::new()
            });

        let evolution_api_url = match get("EVOLUTION_API_URL") {
            Some(url) => http_url("EVOLUTION_API_URL", &url, &mut problems),
            None => {
                problems.push("EVOLUTION_API_URL is required".to_string());
                String::new()
            }
        };

        let supabase_url = get("SUPABASE_URL").map(|url| http_url("SUPABASE_URL", &url, &mut problems));

        let evolution_api_key = get("EVOLUTION_API_KEY").unwrap_or_else(|| {
            problems.push("EVOLUTION_API_KEY is required".to_string());
            String::new()
        });

        let timeout_secs = parse_positive(&get, "EVOLUTION_TIMEOUT_SECS", 20u64, &mut problems);

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            poll_interval: Duration::from_secs(parse_positive(
                &get,
                "QUEUE_POLL_SECS",
                defaults.poll_interval.as_secs(),
                &mut problems,
            )),
            batch_size: parse_positive(&get, "QUEUE_BATCH_SIZE", defaults.batch_size, &mut problems),
            max_attempts: parse_positive(
                &get,
                "QUEUE_MAX_ATTEMPTS",
                defaults.max_attempts,
                &mut problems,
            ),
            backoff_base_secs: parse_positive(
                &get,
                "QUEUE_BACKOFF_BASE_SECS",
                defaults.backoff_base_secs,
                &mut problems,
            ),
            backoff_max_secs: parse_positive(
                &get,
                "QUEUE_BACKOFF_MAX_SECS",
                defaults.backoff_max_secs,
                &mut problems,
            ),
        };
        if queue.backoff_max_secs < queue.backoff_base_secs {
            problems.push(
                "QUEUE_BACKOFF_MAX_SECS must be >= QUEUE_BACKOFF_BASE_SECS".to_string(),
            );
        }

        if !problems.is_empty() {
            return Err(ConfigError { problems });
        }

        Ok(Self {
            port,
            database_url,
            api_token,
            evolution_api_url,
            evolution_api_key,
            evolution_timeout: Duration::from_secs(timeout_secs),
            supabase_url,
            queue,
        })
    }

    /// Convenience for tests and tools that hold their settings in a map.
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }
}

fn http_url(key: &str, url: &str, problems: &mut Vec<String>) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.trim_end_matches('/').to_string();
    }
    problems.push(format!("{key} must be an http(s) url, got '{url}'"));
    String::new()
}

fn parse_positive<T, G>(get: &G, key: &str, default: T, problems: &mut Vec<String>) -> T
where
    T: std::str::FromStr + PartialOrd + Default + Copy,
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            problems.push(format!("{key} must be a positive number, got '{raw}'"));
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HashMap<String, String> {
        [
            ("DATABASE_URL", "postgres://localhost/inbox"),
            ("API_TOKEN", "secret"),
            ("EVOLUTION_API_URL", "https://evo.example.com/"),
            ("EVOLUTION_API_KEY", "evo-key"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn loads_defaults_and_trims_url() {
        let config = Config::from_map(&base()).expect("config should load");
        assert_eq!(config.port, 4000);
        assert_eq!(config.evolution_api_url, "https://evo.example.com");
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.evolution_timeout, Duration::from_secs(20));
    }

    #[test]
    fn service_role_key_is_accepted_as_token() {
        let mut values = base();
        values.remove("API_TOKEN");
        values.insert("SUPABASE_SERVICE_ROLE_KEY".into(), "service-role".into());
        let config = Config::from_map(&values).expect("config should load");
        assert_eq!(config.api_token, "service-role");
    }

    #[test]
    fn reports_every_problem_at_once() {
        let mut values = base();
        values.remove("DATABASE_URL");
        values.remove("EVOLUTION_API_KEY");
        values.insert("PORT".into(), "zero".into());
        values.insert("QUEUE_MAX_ATTEMPTS".into(), "0".into());
        let err = Config::from_map(&values).expect_err("config should fail");
        assert_eq!(err.problems.len(), 4, "{:?}", err.problems);
        assert!(err.to_string().contains("DATABASE_URL"));
        assert!(err.to_string().contains("QUEUE_MAX_ATTEMPTS"));
    }

    #[test]
    fn rejects_non_http_gateway_url() {
        let mut values = base();
        values.insert("EVOLUTION_API_URL".into(), "evo.local:8080".into());
        let err = Config::from_map(&values).expect_err("config should fail");
        assert!(err.problems[0].contains("http(s)"));
    }

    #[test]
    fn supabase_url_is_optional_but_checked() {
        let config = Config::from_map(&base()).expect("config should load");
        assert_eq!(config.supabase_url, None);

        let mut values = base();
        values.insert("SUPABASE_URL".into(), "https://abc.supabase.co/".into());
        let config = Config::from_map(&values).expect("config should load");
        assert_eq!(config.supabase_url.as_deref(), Some("https://abc.supabase.co"));

        values.insert("SUPABASE_URL".into(), "abc.supabase.co".into());
        let err = Config::from_map(&values).expect_err("config should fail");
        assert!(err.problems[0].starts_with("SUPABASE_URL"));
    }

    #[test]
    fn rejects_backoff_cap_below_base() {
        let mut values = base();
        values.insert("QUEUE_BACKOFF_BASE_SECS".into(), "600".into());
        values.insert("QUEUE_BACKOFF_MAX_SECS".into(), "60".into());
        assert!(Config::from_map(&values).is_err());
    }
}
