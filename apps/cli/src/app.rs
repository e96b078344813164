//! Command execution.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use speedprobe_transfer::{
    CallbackListener, ErrorKind, RepeatController, RepeatRequest, TransferEngine, TransferError,
    TransferReport,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::{Cli, Command};

enum Outcome {
    Finished(TransferReport),
    Failed(ErrorKind, String),
}

/// Runs the parsed command to completion.
pub async fn run(cli: Cli, mut config: Config) -> anyhow::Result<()> {
    apply_overrides(&cli, &mut config)?;
    let json = cli.json;

    let report = match cli.command {
        Command::Download {
            uri,
            max_duration_ms,
        } => {
            let engine = TransferEngine::with_config(config.transfer)?;
            let rx = attach(&engine);
            let starter = engine.clone();
            drive(&engine, rx, async move {
                match max_duration_ms {
                    Some(ms) => {
                        starter
                            .start_fixed_download(&uri, Duration::from_millis(ms))
                            .await
                    }
                    None => starter.start_download(&uri).await,
                }
            })
            .await?
        }
        Command::Upload {
            uri,
            size,
            max_duration_ms,
            ..
        } => {
            let size = size.unwrap_or(config.upload_size);
            let engine = TransferEngine::with_config(config.transfer)?;
            let rx = attach(&engine);
            let starter = engine.clone();
            drive(&engine, rx, async move {
                match max_duration_ms {
                    Some(ms) => {
                        starter
                            .start_fixed_upload(&uri, size, Duration::from_millis(ms))
                            .await
                    }
                    None => starter.start_upload(&uri, size).await,
                }
            })
            .await?
        }
        Command::Repeat {
            uri, upload_size, ..
        } => {
            let engine = TransferEngine::with_config(config.transfer)?;
            engine.add_listener(Arc::new(CallbackListener::new().on_error(
                |kind, message| warn!(%kind, error = message, "iteration failed"),
            )));
            let request = match upload_size {
                Some(size) => RepeatRequest::Upload { uri, size },
                None => RepeatRequest::Download { uri },
            };
            repeat(engine, config.repeat.to_repeat_config(), request).await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", summary(&report));
    }
    Ok(())
}

/// Folds command-line flags into the loaded configuration.
fn apply_overrides(cli: &Cli, config: &mut Config) -> anyhow::Result<()> {
    if let Some(proxy) = &cli.proxy {
        config
            .transfer
            .set_proxy(proxy)
            .context("invalid --proxy")?;
    }
    if let Some(ms) = cli.timeout_ms {
        config.transfer.socket_timeout_ms = ms;
    }

    match &cli.command {
        Command::Upload {
            storage,
            chunk_size,
            ..
        } => {
            if let Some(storage) = storage {
                config.transfer.upload_storage = (*storage).into();
            }
            if let Some(size) = chunk_size {
                config.transfer.upload_chunk_size = *size;
            }
        }
        Command::Repeat {
            window_ms,
            interval_ms,
            finish_in_flight,
            ..
        } => {
            if let Some(ms) = window_ms {
                config.repeat.window_ms = *ms;
            }
            if let Some(ms) = interval_ms {
                config.repeat.report_interval_ms = *ms;
            }
            if *finish_in_flight {
                config.repeat.finish_in_flight = true;
            }
        }
        Command::Download { .. } => {}
    }

    config.transfer.validate()?;
    Ok(())
}

/// Registers a listener that prints progress and forwards the outcome.
fn attach(engine: &TransferEngine) -> mpsc::UnboundedReceiver<Outcome> {
    let (tx, rx) = mpsc::unbounded_channel();
    let failed = tx.clone();
    let listener = CallbackListener::new()
        .on_progress(print_progress)
        .on_completion(move |report| {
            let _ = tx.send(Outcome::Finished(report.clone()));
        })
        .on_error(move |kind, message| {
            let _ = failed.send(Outcome::Failed(kind, message.to_string()));
        });
    engine.add_listener(Arc::new(listener));
    rx
}

/// Starts a transfer and waits for its outcome, cancelling on Ctrl-C.
async fn drive<F>(
    engine: &TransferEngine,
    mut rx: mpsc::UnboundedReceiver<Outcome>,
    start: F,
) -> anyhow::Result<TransferReport>
where
    F: Future<Output = Result<(), TransferError>> + Send + 'static,
{
    let mut start = tokio::spawn(start);
    let mut started = false;

    let outcome = loop {
        tokio::select! {
            outcome = rx.recv() => break outcome,
            joined = &mut start, if !started => {
                joined?.context("failed to start transfer")?;
                started = true;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, cancelling transfer");
                engine.cancel();
            }
        }
    };
    engine.shutdown_and_wait().await;
    eprintln!();

    match outcome {
        Some(Outcome::Finished(report)) => Ok(report),
        Some(Outcome::Failed(kind, message)) => bail!("{kind}: {message}"),
        None => bail!("transfer ended without a result"),
    }
}

async fn repeat(
    engine: TransferEngine,
    config: speedprobe_transfer::RepeatConfig,
    request: RepeatRequest,
) -> anyhow::Result<TransferReport> {
    let controller = RepeatController::new(engine.clone(), config);
    let handle = controller.start(request, Box::new(print_progress), Box::new(|_| {}))?;

    let stop = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping repeat");
            stop.cancel();
        }
    });

    let report = handle.wait().await;
    interrupt.abort();
    engine.shutdown_and_wait().await;
    eprintln!();
    Ok(report)
}

fn print_progress(report: &TransferReport) {
    let mut err = std::io::stderr().lock();
    let _ = write!(
        err,
        "\r{:>3}%  {:>12} bytes  {:>10.2} Mbit/s",
        report.progress_percent,
        report.bytes_transferred,
        report.rate_bits_per_sec / 1e6
    );
    let _ = err.flush();
}

/// One-line human readable result.
fn summary(report: &TransferReport) -> String {
    let mut line = format!(
        "{}: {} bytes in {:.3} s, {:.2} Mbit/s ({} bit/s, setup {} ms)",
        report.mode,
        report.bytes_transferred,
        report.elapsed.as_secs_f64(),
        report.rate_bits_per_sec / 1e6,
        report.rate_bits_decimal(),
        report.setup_time.as_millis(),
    );
    if report.cancelled {
        line.push_str(" [cancelled]");
    }
    line
}
