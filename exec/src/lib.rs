mod cli;
mod event_processor;
mod event_processor_with_human_output;
mod event_processor_with_json_output;

use std::io::IsTerminal;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
pub use cli::Cli;
use cli::Color;
use event_processor::EventProcessor;
use event_processor_with_human_output::EventProcessorWithHumanOutput;
use event_processor_with_json_output::EventProcessorWithJsonOutput;
use stepwise_core::Session;
use stepwise_core::approval::ApprovalDecision;
use stepwise_core::approval::ApprovalHandle;
use stepwise_core::config::Config;
use stepwise_core::config::ConfigOverrides;
use stepwise_core::fixture_client::FixtureClient;
use stepwise_core::flags::STEPWISE_LLM_FIXTURE;
use stepwise_core::protocol::Event;
use stepwise_core::protocol::EventMsg;
use stepwise_core::tools::ToolRegistry;
use stepwise_core::util::cancel_on_sigint;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?,
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();

    let Cli {
        model,
        max_steps,
        approval_policy,
        cwd,
        fixture,
        json,
        color,
        prompt,
    } = cli;

    let prompt = match prompt {
        Some(p) if p != "-" => p,
        maybe_dash => {
            // Read the prompt from stdin when it is piped or `-` was given.
            let force_stdin = matches!(maybe_dash.as_deref(), Some("-"));
            if std::io::stdin().is_terminal() && !force_stdin {
                eprintln!(
                    "No prompt provided. Either specify one as an argument or pipe the prompt into stdin."
                );
                std::process::exit(1);
            }
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read prompt from stdin")?;
            if buffer.trim().is_empty() {
                eprintln!("No prompt provided via stdin.");
                std::process::exit(1);
            }
            buffer
        }
    };

    let Some(fixture) = fixture.or_else(|| STEPWISE_LLM_FIXTURE.map(PathBuf::from)) else {
        eprintln!("No model responses configured. Pass --fixture or set STEPWISE_LLM_FIXTURE.");
        std::process::exit(1);
    };
    let client = FixtureClient::from_path(&fixture)
        .with_context(|| format!("failed to load fixture {}", fixture.display()))?;

    let overrides = ConfigOverrides {
        model,
        max_steps,
        approval_policy: approval_policy.map(Into::into),
        sandbox_policy: None,
        cwd,
    };
    let config = Config::load_with_overrides(overrides)?;

    let stdout_with_ansi = match color {
        Color::Always => true,
        Color::Never => false,
        Color::Auto => std::io::stdout().is_terminal(),
    };
    let mut event_processor: Box<dyn EventProcessor> = if json {
        Box::new(EventProcessorWithJsonOutput::new())
    } else {
        Box::new(EventProcessorWithHumanOutput::create_with_ansi(
            stdout_with_ansi,
        ))
    };
    event_processor.print_config_summary(&config, &prompt);

    let (tx, rx) = async_channel::unbounded::<Event>();
    let session = Session::new(
        config,
        Arc::new(client),
        Arc::new(ToolRegistry::with_builtin_tools()),
        Arc::new(tx),
    );

    let cancel = cancel_on_sigint();
    let event_loop = tokio::spawn(process_events(
        rx,
        event_processor,
        session.approval_handle(),
        std::io::stdin().is_terminal(),
        cancel.clone(),
    ));

    let result = session.run_turn(prompt, cancel).await;
    // Dropping the session closes the event channel, which ends the loop.
    drop(session);
    if let Err(e) = event_loop.await {
        warn!("event loop failed: {e}");
    }

    match result {
        Ok(outcome) => {
            info!(?outcome, "turn complete");
            Ok(())
        }
        Err(e) => {
            debug!("turn failed: {e}");
            // The `error` event has already been printed; skip waiting on a
            // pending approval prompt.
            std::process::exit(1);
        }
    }
}

async fn process_events(
    rx: async_channel::Receiver<Event>,
    mut event_processor: Box<dyn EventProcessor>,
    approvals: ApprovalHandle,
    interactive: bool,
    cancel: CancellationToken,
) {
    while let Ok(event) = rx.recv().await {
        let request_id = match &event.msg {
            EventMsg::PatchApprovalRequest { request_id, .. } => Some(request_id.clone()),
            _ => None,
        };
        event_processor.process_event(event);

        let Some(request_id) = request_id else {
            continue;
        };
        let approved = if interactive {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                approved = request_user_approval() => approved,
            }
        } else {
            eprintln!("stdin is not a terminal; denying patch request {request_id}");
            false
        };
        approvals.submit(ApprovalDecision {
            request_id,
            approved,
        });
    }
}

async fn request_user_approval() -> bool {
    let answer = tokio::task::spawn_blocking(|| -> std::io::Result<String> {
        // stderr keeps the prompt out of JSON output on stdout.
        eprint!("Apply this patch? [y/N] ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await;

    match answer {
        Ok(Ok(line)) => {
            let answer = line.trim().to_ascii_lowercase();
            answer == "y" || answer == "yes"
        }
        Ok(Err(e)) => {
            warn!("failed to read approval: {e}");
            false
        }
        Err(e) => {
            warn!("approval prompt panicked: {e}");
            false
        }
    }
}
