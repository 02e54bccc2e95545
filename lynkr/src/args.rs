use std::net::SocketAddr;

use clap::Parser;

/// Self-hosted LLM proxy with an agentic control loop.
#[derive(Debug, Parser)]
#[command(name = "lynkr", version, about)]
pub(crate) struct Args {
    /// Path to the lynkr.toml configuration file.
    #[arg(short, long, env = "LYNKR_CONFIG", default_value = "lynkr.toml")]
    pub config: String,

    /// Socket address to bind, overriding the configuration.
    #[arg(short, long, env = "LYNKR_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log filter (e.g. "info" or "lynkr_llm=debug,lynkr_agent=debug").
    #[arg(long, env = "LYNKR_LOG", default_value = "info")]
    pub log: String,
}
