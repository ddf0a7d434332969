//! Register an agent and build its environment.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::Path;

use kratos::agent::store::validate_name;
use kratos::agent::{extract, AgentRecord};
use kratos::{Config, Dispatcher};

pub(crate) async fn run(
    config: &Config,
    name: &str,
    definition: &Path,
    dependencies: Vec<String>,
) -> Result<()> {
    let bytes = fs::read(definition)
        .with_context(|| format!("Failed to read definition: {}", definition.display()))?;

    // Reject bad input before connecting to Docker.
    validate_name(name)?;
    extract(&bytes)?;

    let dispatcher = Dispatcher::open(config).await?;
    dispatcher.submit(bytes, name, dependencies).await?;

    let record = dispatcher
        .get(name)
        .with_context(|| format!("Agent '{name}' disappeared after submit"))?;
    print!("{}", format_submitted(&record));

    Ok(())
}

fn format_submitted(record: &AgentRecord) -> String {
    let mut out = String::new();

    writeln!(
        &mut out,
        "\n{} Agent {} is ready",
        "✓".green().bold(),
        record.name.cyan().bold()
    )
    .unwrap();

    if let Some(image) = &record.image {
        writeln!(&mut out, "  Image:        {}", image.tag.cyan()).unwrap();
        for model in &image.models {
            let size = model
                .size_bytes
                .map(|bytes| format!(" ({})", format_size(bytes)))
                .unwrap_or_default();
            writeln!(&mut out, "  Model:        {}{}", model.reference, size.dimmed()).unwrap();
        }
    }

    if !record.dependencies.is_empty() {
        writeln!(
            &mut out,
            "  Dependencies: {}",
            record.dependencies.join(", ")
        )
        .unwrap();
    }

    writeln!(
        &mut out,
        "\nRun {} to use it.",
        format!("kratos invoke {} \"<task>\"", record.name).green()
    )
    .unwrap();

    out
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let bytes = bytes as f64;
    if bytes >= GB {
        format!("{:.1} GB", bytes / GB)
    } else {
        format!("{:.0} MB", bytes / MB)
    }
}
