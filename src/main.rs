use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_relay::channels::{EmailConfig, EmailSink, EmailSource, TelegramConfig, TelegramSink};
use inbox_relay::config::{RelayConfig, SinkKind};
use inbox_relay::llm::{LlmConfig, Summarizer};
use inbox_relay::net::TcpProbe;
use inbox_relay::pipeline::{
    Command, CommandInvoker, ContinuousRunner, DeliverCapability, EventNotifier, FetchCapability,
    LoggingListener, PipelineCoordinator, RunOutcome, Scheduler,
};

/// What the binary was asked to do.
enum Mode {
    Run,
    Once,
    Sample,
    Schedule(u64),
}

fn parse_mode(args: &[String]) -> anyhow::Result<Mode> {
    match args.first().map(String::as_str) {
        None | Some("run") => Ok(Mode::Run),
        Some("once") => Ok(Mode::Once),
        Some("sample") => Ok(Mode::Sample),
        Some("schedule") => {
            let minutes = args
                .get(1)
                .context("usage: inbox-relay schedule <minutes>")?
                .parse()
                .context("schedule interval must be a whole number of minutes")?;
            Ok(Mode::Schedule(minutes))
        }
        Some(other) => bail!("unknown command '{other}' (expected run, once, sample or schedule)"),
    }
}

/// Console logging always; a daily rolling file too when `RELAY_LOG_DIR` is set.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match std::env::var("RELAY_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        bail!("failed to install rustls crypto provider");
    }

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = parse_mode(&args)?;
    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    eprintln!("📬 Inbox Relay v{}", env!("CARGO_PKG_VERSION"));

    // ── Capabilities ────────────────────────────────────────────────────
    let email_config = EmailConfig::from_env();
    let source = Arc::new(EmailSource::new(email_config.clone()));
    source.set_query(config.query.clone());

    let sink: Arc<dyn DeliverCapability> = match config.sink {
        SinkKind::Telegram => Arc::new(TelegramSink::new(TelegramConfig::from_env())),
        SinkKind::Email => Arc::new(EmailSink::new(email_config.clone())),
    };

    let llm_config = LlmConfig::from_env();
    let summarizer = Arc::new(Summarizer::new(llm_config));

    eprintln!("   Source: email ({})", display_or_unset(&email_config.imap_host));
    eprintln!("   Sink: {}", sink.name());
    eprintln!("   Model: {}", summarizer.model());

    // ── Pipeline ────────────────────────────────────────────────────────
    let notifier = EventNotifier::new();
    notifier.subscribe(Arc::new(LoggingListener));

    let coordinator = Arc::new(PipelineCoordinator::new(
        source,
        summarizer,
        sink,
        notifier,
        config.pipeline.clone(),
    ));
    let invoker = Arc::new(CommandInvoker::new(
        Arc::clone(&coordinator),
        config.runner.history_cap,
    ));
    let runner = Arc::new(ContinuousRunner::new(
        Arc::clone(&invoker),
        Arc::new(TcpProbe::new(config.network_probe.clone())),
        config.runner.clone(),
    ));

    let code = match mode {
        Mode::Run => {
            let mut task = {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move { runner.run().await })
            };
            let finished = tokio::select! {
                r = &mut task => r,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupt received, shutting down");
                    runner.cancel();
                    task.await
                }
            };
            finished
                .context("runner task panicked")?
                .context("runner stopped")?;
            ExitCode::SUCCESS
        }
        Mode::Once => match runner.run_once().await {
            RunOutcome::Success(result) => {
                eprintln!("{}", result.summary());
                ExitCode::SUCCESS
            }
            RunOutcome::Retry { reason } => {
                eprintln!("Retry later: {reason}");
                ExitCode::from(1)
            }
            RunOutcome::Failure { reason } => {
                eprintln!("Failed: {reason}");
                ExitCode::from(2)
            }
        },
        Mode::Sample => {
            let result = invoker
                .dispatch(Command::ProcessSample)
                .await
                .context("sample run failed")?;
            eprintln!("{}", result.summary());
            if result.failure_count == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Mode::Schedule(minutes) => {
            let scheduler = Scheduler::new(Arc::clone(&runner));
            scheduler.schedule(minutes);
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            tracing::info!("Interrupt received, unscheduling");
            scheduler.cancel_schedule();
            runner.cancel();
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() { "not configured" } else { value }
}
