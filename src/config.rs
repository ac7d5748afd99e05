// Environment-variable configuration (§6, §10.3). Grounded in squall's
// `Config::from_env()`: a plain struct populated from `std::env::var`.
use std::env;

const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
const DEFAULT_PORT: u16 = 8888;
const DEFAULT_DB: &str = "sectorflux.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub ollama_host: String,
    pub port: u16,
    pub db_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        let ollama_host = env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_OLLAMA_HOST.to_string());

        let port = match env::var("SECTORFLUX_PORT") {
            Ok(raw) => match raw.parse::<u16>() {
                Ok(p) if p >= 1 => p,
                _ => {
                    tracing::warn!("SECTORFLUX_PORT={raw:?} is invalid, falling back to {DEFAULT_PORT}");
                    DEFAULT_PORT
                }
            },
            Err(_) => DEFAULT_PORT,
        };

        let db_path = env::var("SECTORFLUX_DB").unwrap_or_else(|_| DEFAULT_DB.to_string());

        Config { ollama_host, port, db_path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Sanity check on the literal defaults without touching the environment.
        assert_eq!(DEFAULT_OLLAMA_HOST, "http://localhost:11434");
        assert_eq!(DEFAULT_PORT, 8888);
        assert_eq!(DEFAULT_DB, "sectorflux.db");
    }
}
