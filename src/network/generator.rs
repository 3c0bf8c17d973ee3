use std::collections::VecDeque;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::network::rule::{render_command, Direction, RuleAction, RuleParam};

/// What drives a dynamic rule file forward: wall-clock seconds or
/// training-round ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IteratorKind {
    Time,
    Epoch,
}

impl IteratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IteratorKind::Time => "time",
            IteratorKind::Epoch => "epoch",
        }
    }
}

/// On-disk representation of a dynamic rule file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFormat {
    Table,
    Script,
}

/// Classify a rule file by name: `time_*` / `epoch_*` prefix picks the
/// iterator kind, a `.json` suffix marks the structured table format.
/// Other names are not rule files.
pub fn classify(file_name: &str) -> Option<(IteratorKind, RuleFormat)> {
    let kind = if file_name.starts_with("time_") {
        IteratorKind::Time
    } else if file_name.starts_with("epoch_") {
        IteratorKind::Epoch
    } else {
        return None;
    };

    let format = if file_name.ends_with(".json") {
        RuleFormat::Table
    } else {
        RuleFormat::Script
    };

    Some((kind, format))
}

#[derive(Deserialize)]
struct RuleTableFile {
    structure: Vec<String>,
    /// Iteration key to rule rows, in file-declared order.
    commands_dict: serde_json::Map<String, serde_json::Value>,
}

/// One parsed dynamic rule file: a lazy, ordered, non-restartable sequence
/// of `(iteration_key, commands)` entries.
///
/// All validation happens at parse time so a malformed file aborts the job
/// before training starts, never in the middle of a run.
#[derive(Debug)]
pub struct RuleGenerator {
    tag: String,
    kind: IteratorKind,
    structure: Vec<RuleParam>,
    entries: VecDeque<(u64, Vec<RuleRow>)>,
}

#[derive(Debug, Clone, PartialEq)]
struct RuleRow {
    action: RuleAction,
    direction: Direction,
    values: Vec<String>,
}

impl RuleGenerator {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("unreadable file name {}", path.display()))?;

        let (kind, format) = match classify(file_name) {
            Some(classified) => classified,
            None => bail!("{file_name:?} is not a dynamic rule file"),
        };

        if format == RuleFormat::Script {
            // Scripted generators never had an execution contract; a table
            // is the only supported format.
            bail!("script rule files are not supported: {}", path.display());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        Self::parse_table(kind, file_name, &raw)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub(crate) fn parse_table(kind: IteratorKind, tag: &str, raw: &str) -> Result<Self> {
        let file: RuleTableFile = serde_json::from_str(raw).context("decoding rule table")?;

        let structure = file
            .structure
            .iter()
            .map(|name| RuleParam::parse(name))
            .collect::<Result<Vec<_>>>()
            .context("parsing structure")?;

        let mut entries = VecDeque::with_capacity(file.commands_dict.len());
        for (key, value) in file.commands_dict {
            let iteration: u64 = key
                .parse()
                .with_context(|| format!("iteration key {key:?} is not an integer"))?;

            let rows = value
                .as_array()
                .with_context(|| format!("iteration {key} does not hold a list of rule rows"))?
                .iter()
                .map(|row| parse_row(row, &structure))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("iteration {key}"))?;

            entries.push_back((iteration, rows));
        }

        Ok(Self {
            tag: tag.to_string(),
            kind,
            structure,
            entries,
        })
    }

    pub fn kind(&self) -> IteratorKind {
        self.kind
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Next `(iteration_key, rendered commands)` entry, or `None` once the
    /// file is exhausted. Entries come out in file-declared order and are
    /// never replayed.
    pub fn next_entry(&mut self, interface: &str) -> Option<(u64, Vec<String>)> {
        let (iteration, rows) = self.entries.pop_front()?;
        let commands = rows
            .iter()
            .map(|row| {
                let args: Vec<(RuleParam, &str)> = self
                    .structure
                    .iter()
                    .copied()
                    .zip(row.values.iter().map(String::as_str))
                    .collect();
                render_command(row.action, interface, row.direction, &args)
            })
            .collect();
        Some((iteration, commands))
    }
}

/// A rule row is `[action, direction, value...]` with exactly one value
/// per structure slot.
fn parse_row(row: &serde_json::Value, structure: &[RuleParam]) -> Result<RuleRow> {
    let fields = row
        .as_array()
        .context("rule row is not a list")?
        .iter()
        .map(|v| {
            v.as_str()
                .map(String::from)
                .with_context(|| format!("rule row field {v} is not a string"))
        })
        .collect::<Result<Vec<String>>>()?;

    if fields.len() != structure.len() + 2 {
        bail!(
            "rule row has {} fields, expected {} (action, direction, one value per parameter)",
            fields.len(),
            structure.len() + 2
        );
    }

    let action = RuleAction::parse(&fields[0])?;
    let direction = Direction::parse(&fields[1])?;
    let values = fields[2..].to_vec();

    for (param, value) in structure.iter().zip(&values) {
        param.validate_value(value)?;
    }

    Ok(RuleRow {
        action,
        direction,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "structure": ["rate", "delay"],
        "commands_dict": {
            "1": [["set", "outgoing", "100Mbps", "10ms"]],
            "5": [
                ["set", "outgoing", "10Mbps", "-1"],
                ["set", "incoming", "-1", "50ms"]
            ],
            "9": [["del", "outgoing", "-1", "-1"]]
        }
    }"#;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("time_wifi.json"),
            Some((IteratorKind::Time, RuleFormat::Table))
        );
        assert_eq!(
            classify("epoch_congestion.json"),
            Some((IteratorKind::Epoch, RuleFormat::Table))
        );
        assert_eq!(
            classify("time_wifi.sh"),
            Some((IteratorKind::Time, RuleFormat::Script))
        );
        assert_eq!(classify("static_rules"), None);
        assert_eq!(classify("notes.json"), None);
    }

    #[test]
    fn test_entries_come_out_in_file_order() {
        let mut gen = RuleGenerator::parse_table(IteratorKind::Epoch, "epoch_t.json", TABLE)
            .expect("should parse");
        assert_eq!(gen.kind(), IteratorKind::Epoch);

        let (key, commands) = gen.next_entry("eth0").expect("entry");
        assert_eq!(key, 1);
        assert_eq!(
            commands,
            vec!["tcset eth0 --direction outgoing --rate 100Mbps --delay 10ms"]
        );

        let (key, commands) = gen.next_entry("eth0").expect("entry");
        assert_eq!(key, 5);
        assert_eq!(
            commands,
            vec![
                "tcset eth0 --direction outgoing --rate 10Mbps",
                "tcset eth0 --direction incoming --delay 50ms",
            ]
        );

        let (key, commands) = gen.next_entry("eth0").expect("entry");
        assert_eq!(key, 9);
        assert_eq!(commands, vec!["tcdel eth0 --direction outgoing"]);
    }

    #[test]
    fn test_exhaustion_is_permanent() {
        let mut gen = RuleGenerator::parse_table(IteratorKind::Time, "time_t.json", TABLE)
            .expect("should parse");
        for _ in 0..3 {
            assert!(gen.next_entry("eth0").is_some());
        }
        assert!(gen.next_entry("eth0").is_none());
        assert!(gen.next_entry("eth0").is_none());
    }

    #[test]
    fn test_invalid_value_fails_at_parse_time() {
        let table = r#"{
            "structure": ["rate"],
            "commands_dict": {"1": [["set", "outgoing", "100xyz"]]}
        }"#;
        let err = RuleGenerator::parse_table(IteratorKind::Time, "time_t.json", table)
            .expect_err("should fail");
        assert!(format!("{err:#}").contains("rate"));
    }

    #[test]
    fn test_row_arity_is_checked() {
        let table = r#"{
            "structure": ["rate", "delay"],
            "commands_dict": {"1": [["set", "outgoing", "100Mbps"]]}
        }"#;
        assert!(RuleGenerator::parse_table(IteratorKind::Time, "time_t.json", table).is_err());
    }

    #[test]
    fn test_non_integer_key_fails() {
        let table = r#"{
            "structure": ["rate"],
            "commands_dict": {"first": [["set", "outgoing", "1Mbps"]]}
        }"#;
        assert!(RuleGenerator::parse_table(IteratorKind::Time, "time_t.json", table).is_err());
    }

    #[test]
    fn test_script_files_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("time_custom.sh");
        std::fs::write(&path, "#!/bin/sh\n").expect("write");

        let err = RuleGenerator::from_file(&path).expect_err("should fail");
        assert!(err.to_string().contains("not supported"));
    }
}
