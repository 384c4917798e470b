//! Command-line and environment configuration.

use crate::dispatch::Stage;
use crate::sandbox::{ResourceLimits, SandboxConfig};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "resl", version)]
#[command(about = "Run code snippets posted as chat commands")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Run one snippet locally and print its output
    Exec(ExecArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Language registry file
    #[arg(long, env = "RESL_LANGUAGES", default_value = "languages.json")]
    pub languages: PathBuf,

    /// Wall-clock limit per execution in milliseconds
    #[arg(long, default_value = "10000")]
    pub timeout_ms: u64,

    /// Where per-execution directories are created (defaults to the system temp dir)
    #[arg(long, env = "RESL_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Captured output is cut to this many bytes
    #[arg(long, default_value = "65536")]
    pub max_output_bytes: usize,

    /// Maximum number of open files
    #[arg(long, default_value = "256")]
    pub nofile: u64,

    /// Maximum file size in KB
    #[arg(long)]
    pub fsize: Option<u64>,

    /// Memory (address space) limit in KB
    #[arg(long)]
    pub mem: Option<u64>,
}

impl SandboxArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            timeout: self.timeout(),
            scratch_dir: self
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            max_output_bytes: self.max_output_bytes,
            limits: ResourceLimits {
                nofile: self.nofile,
                fsize_kb: self.fsize,
                mem_kb: self.mem,
            },
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "RESL_PORT", default_value = "8080")]
    pub port: u16,

    /// Shared secret used to sign incoming webhooks
    #[arg(long, env = "RESL_SIGNING_SECRET", hide_env_values = true)]
    pub signing_secret: String,

    /// Bot token used to open input forms
    #[arg(long, env = "RESL_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// Endpoint that opens input forms
    #[arg(
        long,
        env = "RESL_VIEWS_OPEN_URL",
        default_value = "https://slack.com/api/views.open"
    )]
    pub views_open_url: String,

    /// Responder stage endpoint; with --sandbox-url, stages are invoked over HTTP
    #[arg(long, env = "RESL_RESPONDER_URL", requires = "sandbox_url")]
    pub responder_url: Option<String>,

    /// Sandbox stage endpoint
    #[arg(long, env = "RESL_SANDBOX_URL", requires = "responder_url")]
    pub sandbox_url: Option<String>,

    /// Token guarding the stage endpoints, sent and checked as x-stage-token
    #[arg(long, env = "RESL_STAGE_TOKEN", hide_env_values = true)]
    pub stage_token: Option<String>,

    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

impl ServeArgs {
    /// Remote stage endpoints, when both are configured.
    pub fn stage_endpoints(&self) -> Option<HashMap<Stage, String>> {
        let responder = self.responder_url.clone()?;
        let sandbox = self.sandbox_url.clone()?;
        Some(HashMap::from([
            (Stage::Responder, responder),
            (Stage::Sandbox, sandbox),
        ]))
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExecArgs {
    /// Language key from the registry
    pub language: String,

    /// Code to run; several arguments are joined with spaces
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub code: Vec<String>,

    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

impl ExecArgs {
    /// The snippet as it would arrive in a chat command.
    pub fn command_text(&self) -> String {
        format!("{} {}", self.language, self.code.join(" "))
    }
}
