//! `kratos init`: scaffold a configuration and an example agent.
//!
//! Deciding what to write is kept apart from writing it, so the decision
//! can be checked without touching the filesystem.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::templates;

/// A file `kratos init` provides.
#[derive(Debug, PartialEq, Eq)]
struct Scaffold {
    path: &'static str,
    content: &'static str,
    about: &'static str,
}

const EXAMPLE_AGENT: &str = "agents/finance.json";

const SCAFFOLD: &[Scaffold] = &[
    Scaffold {
        path: "kratos.toml",
        content: templates::KRATOS_TOML,
        about: "engine configuration",
    },
    Scaffold {
        path: EXAMPLE_AGENT,
        content: templates::AGENT_JSON,
        about: "example finance agent",
    },
];

/// What happens to one scaffold file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Write,
    Replace,
    Keep,
}

pub(crate) fn run(force: bool) -> Result<()> {
    let root = std::env::current_dir().context("Failed to get current directory")?;
    info!("Initializing Kratos in {}", root.display());

    let planned = plan(SCAFFOLD, force, |path| root.join(path).exists());
    apply(&root, &planned)?;
    print!("{}", report(&planned));
    Ok(())
}

fn plan<'a>(
    files: &'a [Scaffold],
    force: bool,
    present: impl Fn(&Path) -> bool,
) -> Vec<(&'a Scaffold, Action)> {
    files
        .iter()
        .map(|file| {
            let action = match (present(Path::new(file.path)), force) {
                (false, _) => Action::Write,
                (true, true) => Action::Replace,
                (true, false) => Action::Keep,
            };
            (file, action)
        })
        .collect()
}

fn apply(root: &Path, planned: &[(&Scaffold, Action)]) -> Result<()> {
    for (file, action) in planned {
        if *action == Action::Keep {
            debug!("Keeping existing {}", file.path);
            continue;
        }
        let target = root.join(file.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&target, file.content)
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    Ok(())
}

fn report(planned: &[(&Scaffold, Action)]) -> String {
    let mut lines = vec![
        String::new(),
        format!("{} Kratos initialized successfully!", "✓".green().bold()),
        String::new(),
    ];

    for (file, action) in planned {
        lines.push(match action {
            Action::Write => format!("  {} - {}", file.path.cyan(), file.about),
            Action::Replace => format!("  {} {} (overwritten)", "↻".blue(), file.path),
            Action::Keep => format!(
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                file.path
            ),
        });
    }

    lines.push(String::new());
    lines.push("Next steps:".yellow().bold().to_string());
    lines.push(format!(
        "  1. Point {} at your base image and model servers",
        "kratos.toml".cyan()
    ));
    lines.push(format!(
        "  2. Build the example: {}",
        format!("kratos submit finance --definition {EXAMPLE_AGENT}").green()
    ));
    lines.push(format!(
        "  3. Ask it something: {}",
        "kratos invoke finance \"What is AAPL trading at?\"".green()
    ));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn actions(planned: &[(&Scaffold, Action)]) -> Vec<Action> {
        planned.iter().map(|(_, action)| *action).collect()
    }

    #[test]
    fn test_plan_writes_missing_files() {
        let planned = plan(SCAFFOLD, false, |_| false);
        assert_eq!(actions(&planned), vec![Action::Write, Action::Write]);
    }

    #[test]
    fn test_plan_keeps_existing_unless_forced() {
        let config_only = |path: &Path| path == Path::new("kratos.toml");

        let planned = plan(SCAFFOLD, false, config_only);
        assert_eq!(actions(&planned), vec![Action::Keep, Action::Write]);

        let planned = plan(SCAFFOLD, true, config_only);
        assert_eq!(actions(&planned), vec![Action::Replace, Action::Write]);
    }

    #[test]
    fn test_apply_writes_scaffold_and_keeps_existing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("kratos.toml"), "# mine").unwrap();

        let planned = plan(SCAFFOLD, false, |path| dir.path().join(path).exists());
        apply(dir.path(), &planned).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("kratos.toml")).unwrap(), "# mine");
        let agent = fs::read_to_string(dir.path().join(EXAMPLE_AGENT)).unwrap();
        assert_eq!(agent, templates::AGENT_JSON);
    }

    #[test]
    fn test_example_agent_is_a_valid_definition() {
        assert!(kratos::agent::parse_definition(templates::AGENT_JSON.as_bytes()).is_ok());
    }

    #[test]
    fn test_report_describes_each_action() {
        let planned = vec![
            (&SCAFFOLD[0], Action::Replace),
            (&SCAFFOLD[1], Action::Keep),
        ];
        let out = report(&planned);

        assert!(out.contains("initialized successfully"));
        assert!(out.contains("kratos.toml (overwritten)"));
        assert!(out.contains("already exists, use --force"));
        assert!(out.contains("kratos submit finance"));

        let fresh = report(&plan(SCAFFOLD, false, |_| false));
        assert!(fresh.contains("example finance agent"));
    }
}
