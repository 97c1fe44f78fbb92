use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use conda_stream::{server, Client, Config, Invocation, TransportKind};

mod cli;
mod render;

use cli::{Cli, Command, RunArgs, ServeArgs};
use render::ProgressRenderer;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(conda) = cli.conda {
        config.conda.program = conda;
    }

    match cli.command {
        Command::Run(args) => run_call(config, args).await,
        Command::Serve(args) => serve(config, args).await,
    }
}

async fn run_call(mut config: Config, args: RunArgs) -> Result<ExitCode> {
    if let Some(url) = args.channel_url {
        config.transport.channel_url = Some(url);
    }

    let mut invocation = Invocation::new(args.subcommand);
    for raw in &args.flags {
        let (key, value) = cli::parse_flag(raw);
        invocation = invocation.flag(key, value);
    }
    invocation.positional = args.positional;
    if !args.no_progress && !invocation.flags.contains_key("quiet") {
        invocation = invocation.flag("quiet", false);
    }

    let kind = if args.channel {
        TransportKind::Channel
    } else {
        TransportKind::Pipe
    };

    // -f quiet=true keeps conda silent even without --no-progress
    let render_progress = invocation.wants_progress();
    let mut call = Client::new(config).invoke(kind, invocation);
    if render_progress {
        let mut renderer = ProgressRenderer::new();
        call.on_progress(move |message| renderer.update(message));
    }
    let cancel = call.cancel_handle();

    let timeout = args.timeout;
    let deadline = async {
        match timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        outcome = &mut call => outcome,
        _ = &mut deadline => {
            tracing::warn!(?timeout, "call timed out, cancelling");
            cancel.cancel();
            call.await
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, cancelling");
            cancel.cancel();
            call.await
        }
    };

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            // conda reports its own failures as {"error": ...} documents
            if value.get("error").is_some() {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(e) => {
            if let Some(raw) = e.raw_output() {
                eprintln!("{}", raw);
            }
            Err(e).context("conda call failed")
        }
    }
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<ExitCode> {
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    tokio::select! {
        result = server::serve(listener, Client::new(config)) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(ExitCode::SUCCESS)
}
