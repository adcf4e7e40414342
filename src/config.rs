use clap::Parser;

/// Env var naming the workspace gateway when `--workspace` is absent.
pub const HOST_ENV: &str = "DATABRICKS_HOST";

#[derive(Debug, Parser, Clone)]
#[command(name = "gateway-relay")]
#[command(
    about = "Local credential-rewriting relay that routes coding-agent API traffic through a workspace gateway"
)]
pub struct Config {
    /// Workspace gateway URL. Falls back to DATABRICKS_HOST.
    #[arg(long)]
    pub workspace: Option<String>,

    /// Preferred local port; a running compatible relay on it is reused.
    #[arg(long, default_value_t = crate::discovery::WELL_KNOWN_PORT)]
    pub port: u16,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path. Defaults to ~/.gateway-relay/relay.log.
    #[arg(long)]
    pub log_file: Option<String>,
}

impl Config {
    /// Resolve and normalize the workspace identity, if any was configured.
    pub fn workspace_url(&self) -> Option<String> {
        self.workspace
            .clone()
            .or_else(|| std::env::var(HOST_ENV).ok())
            .map(|raw| normalize_workspace(&raw))
            .filter(|url| !url.is_empty())
    }
}

/// Normalize a workspace URL: scheme-prefixed, no trailing slash.
pub fn normalize_workspace(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let with_scheme = if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}
