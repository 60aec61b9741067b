use std::collections::BTreeSet;
use std::fs::{self, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::warn;

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("api_key", r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("secret", r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("bearer", r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)"),
        ("sk_token", r"(sk-[A-Za-z0-9]{16,})"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| match Regex::new(pattern) {
        Ok(regex) => Some((name, regex)),
        Err(err) => {
            warn!(pattern = name, error = %err, "skipping invalid redaction pattern");
            None
        }
    })
    .collect()
});

/// Summary of a finished pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineLogInput {
    pub run_id: String,
    pub topic: String,
    pub succeeded_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub missing_sections: Vec<String>,
    pub sources: Vec<String>,
    pub report_path: Option<String>,
}

#[derive(Serialize)]
struct PipelineLogRecord {
    timestamp: String,
    run_id: String,
    topic: String,
    succeeded_tasks: Vec<String>,
    failed_tasks: Vec<String>,
    missing_sections: Vec<String>,
    sources: Vec<String>,
    report_path: Option<String>,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    run_id: String,
    redactions: Vec<String>,
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{line}")
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Replace anything that looks like a credential.
pub fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .into_owned();
        if matched {
            redactions.insert((*name).to_string());
        }
    }
    output
}

/// Append a redacted pipeline record under `<base_dir>/<yyyy>/<mm>/pipeline.jsonl`.
pub fn log_pipeline_completion(
    base_dir: &Path,
    retention_days: u64,
    input: PipelineLogInput,
) -> Result<()> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();

    let topic = sanitize_text(&input.topic, &mut redactions);
    let sources: Vec<String> = input
        .sources
        .iter()
        .map(|source| sanitize_text(source, &mut redactions))
        .collect();
    let failed_tasks: Vec<String> = input
        .failed_tasks
        .iter()
        .map(|task| sanitize_text(task, &mut redactions))
        .collect();

    let record = PipelineLogRecord {
        timestamp: timestamp.to_rfc3339(),
        run_id: input.run_id.clone(),
        topic,
        succeeded_tasks: input.succeeded_tasks,
        failed_tasks,
        missing_sections: input.missing_sections,
        sources,
        report_path: input.report_path,
        redactions: redactions.into_iter().collect(),
    };

    let month_dir = base_dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    append_json_line(&month_dir.join("pipeline.jsonl"), &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: record.timestamp.clone(),
            run_id: input.run_id.clone(),
            redactions: record.redactions.clone(),
        };
        append_json_line(&month_dir.join("audit.jsonl"), &audit)?;
        warn!(
            run_id = %input.run_id,
            fields = ?record.redactions,
            "redacted potential secrets from pipeline log"
        );
    }

    enforce_retention(base_dir, retention_days)
}

fn enforce_retention(base_dir: &Path, retention_days: u64) -> Result<()> {
    if retention_days == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn pipeline_logging_sanitizes_and_persists() -> Result<()> {
        let temp = tempfile::tempdir()?;

        let input = PipelineLogInput {
            run_id: "run-1".to_string(),
            topic: "Moutai outlook api_key=abcd1234".to_string(),
            succeeded_tasks: vec!["collect-balance".to_string()],
            failed_tasks: vec!["collect-news: bearer XYZ rejected".to_string()],
            missing_sections: vec!["Risks".to_string()],
            sources: vec!["https://data.example.com?k=sk-abcdef1234567890".to_string()],
            report_path: Some("report.md".to_string()),
        };

        log_pipeline_completion(temp.path(), 0, input)?;

        let year_dir = temp.path().read_dir()?.next().unwrap()?.path();
        let month_dir = year_dir.read_dir()?.next().unwrap()?.path();
        let line = std::fs::read_to_string(month_dir.join("pipeline.jsonl"))?;
        let record: Value = serde_json::from_str(line.trim())?;
        assert_eq!(record["run_id"], "run-1");
        assert!(record["topic"].as_str().unwrap().contains("[REDACTED]"));
        assert!(!line.contains("abcdef1234567890"));
        assert_eq!(record["missing_sections"][0], "Risks");

        let audit = std::fs::read_to_string(month_dir.join("audit.jsonl"))?;
        assert!(audit.contains("api_key"));
        assert!(audit.contains("bearer"));
        Ok(())
    }

    #[test]
    fn clean_text_is_untouched() {
        let mut redactions = BTreeSet::new();
        let out = sanitize_text("quarterly revenue grew 12%", &mut redactions);
        assert_eq!(out, "quarterly revenue grew 12%");
        assert!(redactions.is_empty());
    }
}
