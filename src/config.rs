//! Typed, environment-driven configuration. Follows the teacher's convention
//! of reading a handful of `PORT`-style env vars with sane defaults rather
//! than requiring a config file.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8084;
const DEFAULT_STALL_WINDOW_SECS: u64 = 300;
const DEFAULT_MAX_SHAPED_ROWS: usize = 10_000;
const DEFAULT_LLM_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_LLM_MODEL: &str = "llama3.1";
const DEFAULT_NL_TO_SPARQL_PROMPT: &str = include_str!("../prompts/nl_to_sparql.txt");

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub stall_window: Duration,
    pub max_shaped_rows: usize,
    pub llm_base_url: String,
    pub llm_model: String,
    pub nl_to_sparql_system_prompt: String,
    pub triplestore_seed_ttl: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let stall_window_secs: u64 = std::env::var("STALL_WINDOW_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STALL_WINDOW_SECS);

        let max_shaped_rows: usize = std::env::var("MAX_SHAPED_ROWS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_SHAPED_ROWS);

        let llm_base_url =
            std::env::var("LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_LLM_BASE_URL.to_string());

        let llm_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string());

        let nl_to_sparql_system_prompt = std::env::var("NL_TO_SPARQL_PROMPT_PATH")
            .ok()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .unwrap_or_else(|| DEFAULT_NL_TO_SPARQL_PROMPT.to_string());

        let triplestore_seed_ttl = std::env::var("TRIPLESTORE_SEED_TTL").ok();

        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            stall_window: Duration::from_secs(stall_window_secs),
            max_shaped_rows,
            llm_base_url,
            llm_model,
            nl_to_sparql_system_prompt,
            triplestore_seed_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // SAFETY-equivalent: env var removal is process-wide but this test
        // does not set any of the vars it reads, so ordering with other
        // tests does not matter as long as they don't set these names.
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.stall_window, Duration::from_secs(300));
        assert_eq!(cfg.max_shaped_rows, 10_000);
        assert_eq!(cfg.llm_model, "llama3.1");
    }
}
