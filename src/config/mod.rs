use std::env;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: u32,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    /// Push endpoint receiving `{topic, title, body}`; dispatch is skipped when unset.
    pub notification_url: Option<String>,
    /// Identity provider lookup used to re-validate admin tokens.
    pub identity_lookup_url: Option<String>,
    pub admin_emails: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let jwt_expiration = env::var("JWT_EXPIRATION")?
            .trim_end_matches('h')
            .parse::<u64>()
            .unwrap_or(24);
        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")?,
            server_host: env::var("SERVER_HOST")?,
            server_port: env::var("SERVER_PORT")?.parse().unwrap_or(3000),
            jwt_secret: env::var("JWT_SECRET")?,
            jwt_expiration_secs: jwt_expiration * 3600,
            rate_limit_window_secs: env::var("RATE_LIMIT_WINDOW")?.parse().unwrap_or(60),
            rate_limit_requests: env::var("RATE_LIMIT_REQUESTS")?.parse().unwrap_or(100),
            api_base_uri: env::var("API_BASE_URI").unwrap_or_else(|_| "/api".into()),
            notification_url: optional_var("NOTIFICATION_URL"),
            identity_lookup_url: optional_var("IDENTITY_LOOKUP_URL"),
            admin_emails: env::var("ADMIN_EMAILS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
        })
    }

    /// Settings for running against the in-process store, with no external services.
    pub fn local() -> Self {
        Config {
            database_url: String::new(),
            redis_url: String::new(),
            jwt_secret: "local-development-secret".into(),
            jwt_expiration_secs: 24 * 3600,
            rate_limit_window_secs: 60,
            rate_limit_requests: 100,
            server_host: "127.0.0.1".into(),
            server_port: 3000,
            api_base_uri: "/api".into(),
            notification_url: None,
            identity_lookup_url: None,
            admin_emails: vec!["admin@smaaks.local".into()],
        }
    }

    pub fn jwt_expiration(&self) -> Duration {
        Duration::from_secs(self.jwt_expiration_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_emails
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(email.trim()))
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_list_is_trimmed_and_case_insensitive() {
        let mut config = Config::local();
        config.admin_emails = parse_list(" Root@Example.com , ,ops@example.com");
        assert_eq!(config.admin_emails.len(), 2);
        assert!(config.is_admin_email("root@example.com"));
        assert!(!config.is_admin_email("someone@example.com"));
    }
}
