use anyhow::Result;
use colored::Colorize;

use kratos::{Config, Dispatcher};

pub(crate) async fn run(config: &Config, name: &str) -> Result<()> {
    let dispatcher = Dispatcher::open(config).await?;

    if dispatcher.remove(name).await {
        println!("{} Removed agent {}", "✓".green().bold(), name.cyan());
    } else {
        println!("{} No agent named {}", "ℹ".blue(), name.cyan());
    }

    Ok(())
}
