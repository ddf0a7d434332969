//! Run one task in a fresh sandbox.

use anyhow::Result;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use kratos::agent::LimitOverrides;
use kratos::sandbox::{OutputSink, OutputStream};
use kratos::{Config, Dispatcher};

/// Agent stderr is always relayed while the task runs. With `stream`,
/// stdout is relayed too and the final result is not printed again.
pub(crate) async fn run(
    config: &Config,
    name: &str,
    task: &str,
    timeout_seconds: Option<u64>,
    max_memory: Option<String>,
    stream: bool,
) -> Result<()> {
    let overrides = LimitOverrides {
        timeout_seconds,
        max_memory,
    };
    let dispatcher = Dispatcher::open(config).await?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; reclaiming the sandbox");
                cancel.cancel();
            }
        })
    };

    let result = dispatcher
        .invoke_streaming(name, task, Some(&overrides), &cancel, &relay(stream))
        .await;
    interrupt.abort();

    let value = result?;
    if !stream {
        println!("{}", format_result(&value));
    }
    Ok(())
}

fn relay(stdout_too: bool) -> OutputSink {
    Arc::new(move |kind: OutputStream, text: &str| {
        if !relays(kind, stdout_too) {
            return;
        }
        // Best effort; a closed terminal must not fail the invocation.
        let _ = match kind {
            OutputStream::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(text.as_bytes()).and_then(|()| out.flush())
            }
            OutputStream::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(text.as_bytes()).and_then(|()| err.flush())
            }
        };
    })
}

fn relays(kind: OutputStream, stdout_too: bool) -> bool {
    match kind {
        OutputStream::Stderr => true,
        OutputStream::Stdout => stdout_too,
    }
}

/// Plain-text agent output prints as-is; anything else as pretty JSON.
fn format_result(value: &Value) -> String {
    if let Some(Value::String(text)) = value.as_object().filter(|o| o.len() == 1).and_then(|o| o.get("output")) {
        return text.clone();
    }
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
