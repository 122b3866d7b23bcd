use std::path::PathBuf;

use clap::Parser;

/// Runtime configuration, populated from flags or environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "insights-server", about = "Spreadsheet insights backend")]
pub struct Config {
    /// Address the HTTP server binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Directory holding blobs and the state snapshot.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Base URL clients use to reach this server, for signed links.
    #[arg(long, env = "PUBLIC_BASE_URL", default_value = "http://localhost:8080")]
    pub public_base_url: String,

    /// Optional external analysis service; when unset, reports complete
    /// with locally computed results only.
    #[arg(long, env = "ANALYSIS_SERVICE_URL")]
    pub analysis_service_url: Option<String>,

    /// Bearer token sent to the analysis service.
    #[arg(long, env = "ANALYSIS_SERVICE_TOKEN", default_value = "")]
    pub analysis_service_token: String,

    /// OpenAI-compatible chat completions endpoint.
    #[arg(
        long,
        env = "AI_GATEWAY_URL",
        default_value = "https://ai.gateway.lovable.dev/v1/chat/completions"
    )]
    pub ai_gateway_url: String,

    /// API key for the AI gateway; unset disables AI summaries and chat.
    #[arg(long, env = "AI_API_KEY")]
    pub ai_api_key: Option<String>,

    #[arg(long, env = "AI_MODEL", default_value = "google/gemini-2.5-flash")]
    pub ai_model: String,

    #[arg(long, env = "SMTP_HOST")]
    pub smtp_host: Option<String>,

    #[arg(long, env = "SMTP_USERNAME", default_value = "")]
    pub smtp_username: String,

    #[arg(long, env = "SMTP_PASSWORD", default_value = "")]
    pub smtp_password: String,

    #[arg(long, env = "SMTP_FROM", default_value = "reports@sheet-insights.local")]
    pub smtp_from: String,

    /// Dashboard URL linked from notification emails.
    #[arg(long, env = "DASHBOARD_URL", default_value = "http://localhost:3000/dashboard")]
    pub dashboard_url: String,

    /// Seconds between scheduler sweeps.
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,
}

impl Config {
    #[cfg(test)]
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir,
            public_base_url: "http://localhost:8080".to_string(),
            analysis_service_url: None,
            analysis_service_token: String::new(),
            ai_gateway_url: "http://localhost:9/v1/chat/completions".to_string(),
            ai_api_key: None,
            ai_model: "google/gemini-2.5-flash".to_string(),
            smtp_host: None,
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_from: "reports@sheet-insights.local".to_string(),
            dashboard_url: "http://localhost:3000/dashboard".to_string(),
            sweep_interval_secs: 300,
        }
    }
}
