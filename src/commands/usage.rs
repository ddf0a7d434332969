//! Resource usage of one agent over a recent window.

use anyhow::Result;
use chrono::{Duration, Utc};
use colored::Colorize;
use std::fmt::Write;

use kratos::meter::{InvocationOutcome, InvocationRecord, ResourceMeter, UsageSummary};
use kratos::Config;

use super::state_paths;

const RECENT: usize = 5;

pub(crate) fn run(config: &Config, name: &str, hours: u32) -> Result<()> {
    let paths = state_paths(config)?;
    let meter = if paths.invocation_log.exists() {
        ResourceMeter::open(&paths.invocation_log)?
    } else {
        ResourceMeter::in_memory()
    };

    let since = Utc::now() - Duration::hours(i64::from(hours));
    let summary = meter.usage_since(name, since);
    let recent = meter.history(name, RECENT);
    print!("{}", format_usage(&summary, hours, &recent));
    Ok(())
}

fn format_usage(summary: &UsageSummary, hours: u32, recent: &[InvocationRecord]) -> String {
    let mut out = String::new();

    writeln!(
        &mut out,
        "\n{} (last {}h)",
        summary.agent_name.cyan().bold(),
        hours
    )
    .unwrap();
    writeln!(&mut out, "{}", "━".repeat(40).dimmed()).unwrap();
    writeln!(&mut out, "  Invocations:   {}", summary.invocations).unwrap();
    writeln!(&mut out, "  Failures:      {}", summary.failures).unwrap();
    writeln!(&mut out, "  Timeouts:      {}", summary.timeouts).unwrap();
    writeln!(&mut out, "  Billed:        {}s", summary.billed_seconds).unwrap();
    writeln!(
        &mut out,
        "  Memory:        {:.2} GB-s",
        summary.memory_gb_seconds
    )
    .unwrap();

    if !recent.is_empty() {
        writeln!(&mut out, "\n{}", "Recent:".yellow().bold()).unwrap();
        for record in recent {
            let status = match &record.outcome {
                InvocationOutcome::Success { .. } => "ok".green(),
                InvocationOutcome::Failure { code, .. } => code.to_string().red(),
            };
            writeln!(
                &mut out,
                "  {}  {:>6}ms  {}  {}",
                record.started_at.format("%Y-%m-%d %H:%M:%S"),
                record.usage.wall_clock_ms,
                status,
                record.task.dimmed()
            )
            .unwrap();
        }
    }

    out
}
