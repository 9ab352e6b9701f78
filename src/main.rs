mod cli;
mod ui;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, Command};
use flowrun::client::{InMemoryOrchestrator, OrchestrationClient, OrchestrationRules, get_client};
use flowrun::config::Settings;
use flowrun::context::FlowRunContext;
use flowrun::engine::{ReturnType, RunOptions, RunOutput, run_flow, run_flow_sync};
use flowrun::flow::{Flow, ParamKind, ParameterSchema, Parameters};
use ui::RunProgress;

struct DemoArgs {
    fail_times: u32,
    retries: u32,
    hold: u32,
    blocking: bool,
    name: String,
    params: Vec<(String, Value)>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::load().context("failed to load settings")?,
    };
    init_tracing(&settings, cli.verbose);

    match cli.command {
        Command::Demo {
            fail_times,
            retries,
            hold,
            blocking,
            name,
            params,
        } => demo(
            &settings,
            DemoArgs {
                fail_times,
                retries,
                hold,
                blocking,
                name,
                params,
            },
        ),
        Command::Check => check(&settings),
    }
}

fn init_tracing(settings: &Settings, verbose: bool) {
    let default = if verbose { "debug" } else { settings.log_filter.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

fn check(settings: &Settings) -> Result<()> {
    let client = get_client(settings)?;
    runtime()?.block_on(async {
        client.connect().await?;
        client.close().await;
        anyhow::Ok(())
    })?;
    match &settings.api_url {
        Some(url) => println!("orchestration API at {url} is reachable"),
        None => println!("no api_url configured, runs use an ephemeral in-memory orchestrator"),
    }
    Ok(())
}

fn demo(settings: &Settings, args: DemoArgs) -> Result<()> {
    let client: Arc<dyn OrchestrationClient> = match &settings.api_url {
        Some(_) => {
            if args.hold > 0 {
                warn!("--hold is only honoured by the in-memory orchestrator");
            }
            get_client(settings)?
        }
        None => Arc::new(InMemoryOrchestrator::with_rules(OrchestrationRules {
            hold_pending: args.hold,
        })),
    };

    let progress = Arc::new(RunProgress::start(&args.name));
    let flow = demo_flow(&args, Arc::clone(&progress));
    let parameters: Parameters = args.params.into_iter().collect();
    let options = RunOptions::from_settings(settings)
        .with_client(client)
        .returning(ReturnType::State);

    info!(flow_name = %flow.name(), blocking = args.blocking, "starting demo run");
    let output = if args.blocking {
        run_flow_sync(&flow, parameters, options)
    } else {
        runtime()?.block_on(run_flow(&flow, parameters, options))
    };

    let state = match output {
        Ok(RunOutput::State(state)) => state,
        Ok(other) => {
            progress.abandon("run returned no state");
            anyhow::bail!("unexpected run output: {other:?}");
        }
        Err(err) => {
            progress.abandon(&err.to_string());
            return Err(err.into());
        }
    };
    progress.complete(&state);
    progress.print_state(&state);
    Ok(())
}

/// Flow that fails its first `fail_times` attempts, then greets.
fn demo_flow(args: &DemoArgs, progress: Arc<RunProgress>) -> Flow {
    let attempts = Arc::new(AtomicU32::new(0));
    let fail_times = args.fail_times;
    let retries = args.retries;
    let flow_name = args.name.clone();

    Flow::from_async(args.name.as_str(), move |params: Parameters| {
        let attempts = Arc::clone(&attempts);
        let progress = Arc::clone(&progress);
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let ctx = FlowRunContext::get()?;
            progress.update(&format!("attempt {attempt}: {}", ctx.state()));

            if attempt <= fail_times {
                progress.retry(attempt, retries, "simulated failure");
                anyhow::bail!("simulated failure on attempt {attempt}");
            }

            let greeting = params
                .get("greeting")
                .and_then(Value::as_str)
                .unwrap_or("hello");
            ctx.print(&format!("{greeting} from {}", ctx.flow().name()));
            Ok(json!({ "greeting": greeting, "attempts": attempt }))
        }
    })
    .with_description("Demo flow that fails a configurable number of times")
    .with_parameters(
        ParameterSchema::new()
            .optional("greeting", ParamKind::Str, json!("hello"))
            .allow_extra(true),
    )
    .with_run_name_fn(move |params| {
        let greeting = params
            .get("greeting")
            .and_then(Value::as_str)
            .unwrap_or("hello");
        Ok(format!("{flow_name}-{greeting}"))
    })
    .with_retries(retries)
    .with_log_prints(true)
    .with_tags(["demo"])
}
