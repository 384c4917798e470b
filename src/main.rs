//! resl - run code snippets posted as chat commands.
//!
//! Usage:
//!   resl serve --signing-secret <secret> [--port 8080]   # Start HTTP server
//!   resl exec <language> <code>...                       # Run one snippet locally

mod command;
mod config;
mod dispatch;
mod error;
mod http_server;
mod modal;
mod pipeline;
mod registry;
mod responder;
mod sandbox;
mod signature;
mod state;
mod types;
mod webhook;

use clap::Parser;
use config::{Args, Commands, ExecArgs, ServeArgs};
use dispatch::HttpTransport;
use modal::HttpForms;
use pipeline::Stages;
use registry::LanguageRegistry;
use responder::{HttpCallback, Responder};
use sandbox::Sandbox;
use state::AppState;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time a remote sandbox call may take on top of the execution timeout.
const STAGE_CALL_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("resl=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    let code = match args.command {
        Commands::Serve(serve) => run_serve(serve).await,
        Commands::Exec(exec) => run_exec(exec).await,
    };
    exit(code);
}

fn load_registry(args: &config::SandboxArgs) -> Option<LanguageRegistry> {
    match LanguageRegistry::load(&args.languages) {
        Ok(registry) => Some(registry),
        Err(e) => {
            error!(error = %e, "Cannot load language registry");
            eprintln!("Error: {}", e);
            None
        }
    }
}

async fn run_serve(args: ServeArgs) -> i32 {
    if args.signing_secret.is_empty() {
        eprintln!("Error: Signing secret must not be empty");
        return 1;
    }
    let Some(registry) = load_registry(&args.sandbox) else {
        return 1;
    };

    let client = reqwest::Client::new();
    let sandbox = Sandbox::new(registry.clone(), args.sandbox.sandbox_config());
    let responder = Responder::new(Box::new(HttpCallback::new(
        client.clone(),
        CALLBACK_TIMEOUT,
    )));

    let stages = match args.stage_endpoints() {
        Some(endpoints) => {
            info!(?endpoints, "Invoking stages over HTTP");
            let transport = HttpTransport::new(
                client.clone(),
                endpoints,
                args.stage_token.clone(),
                args.sandbox.timeout() + STAGE_CALL_MARGIN,
            );
            Stages::with_transport(sandbox, responder, Arc::new(transport))
        }
        None => Stages::in_process(sandbox, responder),
    };

    let state = AppState {
        registry,
        signing_secret: Arc::from(args.signing_secret.as_str()),
        stages,
        forms: Arc::new(HttpForms::new(
            client,
            args.views_open_url.clone(),
            args.bot_token.clone(),
        )),
        stage_token: args.stage_token.as_deref().map(Arc::from),
    };

    if let Err(e) = http_server::run_server(args.port, state).await {
        error!(error = %e, "Server stopped");
        eprintln!("Error: {}", e);
        return 1;
    }
    0
}

async fn run_exec(args: ExecArgs) -> i32 {
    let Some(registry) = load_registry(&args.sandbox) else {
        return 1;
    };

    let parsed = match command::parse(&args.command_text(), &registry) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let sandbox = Sandbox::new(registry, args.sandbox.sandbox_config());
    match sandbox.execute(&parsed.language_key, &parsed.code).await {
        Ok(result) => {
            print!("{}", result.stdout);
            if let Some(reason) = &result.failure_reason {
                eprint!("{}", reason);
            }
            result.exit.code.unwrap_or(1)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}
