use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("VIEWLINK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}
