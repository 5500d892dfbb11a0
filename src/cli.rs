use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Aegis — policy-enforcing MCP proxy for AI agents.
#[derive(Debug, Parser)]
#[command(name = "aegis", version, about)]
pub struct Cli {
    /// Transport to listen on.
    #[arg(long, value_enum, default_value_t = Transport::Stdio)]
    pub transport: Transport,

    /// Configuration file (YAML or JSON).
    #[arg(long, default_value = "aegis.yaml")]
    pub config: PathBuf,

    /// Override the HTTP port from the config file.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    Stdio,
    Http,
}

// ── Tests ────────────────────────────────────────────────────
