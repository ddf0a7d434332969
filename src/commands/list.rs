//! Show registered agents and their build state.
//!
//! Reads the persisted records directly, so it works without Docker and
//! never disturbs a build in progress.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use kratos::agent::{AgentRecord, AgentStatus, AgentStore};
use kratos::Config;

use super::state_paths;

pub(crate) fn run(config: &Config) -> Result<()> {
    let paths = state_paths(config)?;
    let records = AgentStore::snapshot(&paths.agents)?;
    print!("{}", format_agents(&records));
    Ok(())
}

fn format_agents(records: &[AgentRecord]) -> String {
    let mut out = String::new();

    if records.is_empty() {
        writeln!(&mut out, "{} No agents registered.", "ℹ".blue()).unwrap();
        writeln!(
            &mut out,
            "  Run {} to add one.",
            "kratos submit <name> --definition <file>".green()
        )
        .unwrap();
        return out;
    }

    for record in records {
        let status = match record.status {
            AgentStatus::Built => "built".green().bold(),
            AgentStatus::Pending => "pending".yellow().bold(),
            AgentStatus::Failed => "failed".red().bold(),
        };
        let models: Vec<String> = record.model_refs.iter().map(ToString::to_string).collect();

        writeln!(&mut out, "{}  {}", record.name.cyan().bold(), status).unwrap();
        writeln!(&mut out, "  Models:   {}", models.join(", ")).unwrap();
        if let Some(image) = &record.image {
            writeln!(&mut out, "  Image:    {}", image.tag).unwrap();
        }
        if let Some(reason) = &record.failure {
            writeln!(&mut out, "  Reason:   {}", reason.red()).unwrap();
        }
        writeln!(
            &mut out,
            "  Updated:  {}",
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .unwrap();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kratos::agent::{LimitOverrides, ModelProvider, ModelRef};
    use kratos::image::Fingerprint;
    use std::collections::BTreeSet;

    fn record(name: &str, status: AgentStatus, failure: Option<&str>) -> AgentRecord {
        let mut record = AgentRecord::pending(
            name,
            b"{}".to_vec(),
            vec![],
            BTreeSet::from([ModelRef::new(ModelProvider::LmStudio, "qwen2.5-7b")]),
            Fingerprint::compute("base", &[], b"{}"),
            LimitOverrides::default(),
        );
        record.status = status;
        record.failure = failure.map(str::to_string);
        record
    }

    #[test]
    fn test_format_agents_empty() {
        let output = format_agents(&[]);
        assert!(output.contains("No agents registered"));
        assert!(output.contains("kratos submit"));
    }

    #[test]
    fn test_format_agents_shows_status_and_models() {
        let output = format_agents(&[
            record("finance", AgentStatus::Pending, None),
            record("research", AgentStatus::Failed, Some("model pull failed")),
        ]);
        assert!(output.contains("finance"));
        assert!(output.contains("pending"));
        assert!(output.contains("lmstudio/qwen2.5-7b"));
        assert!(output.contains("research"));
        assert!(output.contains("failed"));
        assert!(output.contains("model pull failed"));
    }
}
