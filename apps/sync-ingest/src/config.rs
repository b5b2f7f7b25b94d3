use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default = "default_true")]
    pub worker_autostart: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            database_max_connections: default_max_connections(),
            log_filter: default_log_filter(),
            log_path: None,
            worker_autostart: true,
            retention_days: default_retention_days(),
            retention_sweep_secs: default_retention_sweep_secs(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|_| AppConfig::default().normalize())
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        if self.log_filter.trim().is_empty() {
            self.log_filter = default_log_filter();
        }
        self.database_max_connections = self.database_max_connections.max(1);
        self.retention_sweep_secs = self.retention_sweep_secs.max(1);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_log_filter() -> String {
    "info,sync_ingest=debug".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> i64 {
    7
}

fn default_retention_sweep_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_normalize_to_none() {
        let cfg = AppConfig {
            database_url: Some("   ".into()),
            log_path: Some(" /tmp/ingest.log ".into()),
            log_filter: String::new(),
            ..AppConfig::default()
        }
        .normalize();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.log_path.as_deref(), Some("/tmp/ingest.log"));
        assert_eq!(cfg.log_filter, "info,sync_ingest=debug");
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.retention_days, 7);
        assert!(cfg.worker_autostart);
    }
}
