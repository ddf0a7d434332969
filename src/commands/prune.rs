//! Remove orphaned sandboxes and unreferenced images.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use kratos::{Config, Dispatcher, PruneReport};

pub(crate) async fn run(config: &Config) -> Result<()> {
    let dispatcher = Dispatcher::open(config).await?;
    let report = dispatcher.prune().await?;
    print!("{}", format_report(&report));
    Ok(())
}

fn format_report(report: &PruneReport) -> String {
    let mut out = String::new();

    if report.orphans_removed == 0 && report.images_removed.is_empty() {
        writeln!(&mut out, "{} Nothing to prune", "✓".green().bold()).unwrap();
        return out;
    }

    writeln!(
        &mut out,
        "{} Removed {} orphaned sandbox(es)",
        "✓".green().bold(),
        report.orphans_removed
    )
    .unwrap();
    writeln!(
        &mut out,
        "{} Removed {} image(s)",
        "✓".green().bold(),
        report.images_removed.len()
    )
    .unwrap();
    for tag in &report.images_removed {
        writeln!(&mut out, "  {}", tag.dimmed()).unwrap();
    }

    out
}
