//! Batch scheduler queue status.
//!
//! The queue command is run through a `CommandExecutor`, either on this
//! machine or on the compute host, and its delimited text output is turned
//! into a table whose columns are exactly what the scheduler printed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use handlebars::Handlebars;
use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::host::HostEntry;
use crate::transport::RunOutput;

/// Runs a command string somewhere and hands back its output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<RunOutput, MonitorError>;
}

/// Runs commands on this machine through `sh -c`.
pub struct LocalExecutor;

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, command: &str) -> Result<RunOutput, MonitorError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        let lines = |bytes: &[u8]| {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::to_owned)
                .collect::<Vec<_>>()
        };
        Ok(RunOutput {
            status: output.status.code(),
            stdout: lines(&output.stdout),
            stderr: lines(&output.stderr),
        })
    }
}

/// Fills `{{name}}` placeholders of a command template. Values are not
/// HTML-escaped.
pub fn render_command(template: &str, vars: &HashMap<&str, &str>) -> Result<String, MonitorError> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    handlebars_misc_helpers::register(&mut registry);
    Ok(registry.render_template(template, vars)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Slurm,
    Pbs,
}

impl SchedulerKind {
    pub fn default_queue_command(&self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "squeue -u {{user}} -o %all",
            SchedulerKind::Pbs => "qstat -u {{user}}",
        }
    }

    /// Splits one line of queue output into fields.
    pub fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self {
            SchedulerKind::Slurm => {
                // `squeue -o %all` ends every line with the delimiter.
                let line = line.trim_end();
                let line = line.strip_suffix('|').unwrap_or(line);
                line.split('|').collect()
            }
            SchedulerKind::Pbs => line.split_whitespace().collect(),
        }
    }
}

/// Queue output with the scheduler's own columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl QueueTable {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row).map(|values| values[index].as_str())
    }

    /// The table restricted to `columns`, in that order. Columns the
    /// scheduler did not report are skipped.
    pub fn select(&self, columns: &[&str]) -> QueueTable {
        let indices: Vec<usize> = columns
            .iter()
            .filter_map(|column| self.column_index(column))
            .collect();
        QueueTable {
            columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        }
    }
}

impl fmt::Display for QueueTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        for row in &self.rows {
            for (width, value) in widths.iter_mut().zip(row) {
                *width = (*width).max(value.len());
            }
        }
        let write_row = |f: &mut fmt::Formatter, values: &[String]| -> fmt::Result {
            for (i, (value, width)) in values.iter().zip(&widths).enumerate() {
                if i + 1 == values.len() {
                    write!(f, "{}", value)?;
                } else {
                    write!(f, "{:<width$}  ", value, width = width)?;
                }
            }
            writeln!(f)
        };
        write_row(f, &self.columns)?;
        for row in &self.rows {
            write_row(f, row)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    /// Nothing of this user is queued or running.
    Empty,
    Jobs(QueueTable),
}

pub struct QueueStatusReader {
    scheduler: SchedulerKind,
    command: String,
}

impl QueueStatusReader {
    pub fn new(scheduler: SchedulerKind, command: impl Into<String>) -> Self {
        Self {
            scheduler,
            command: command.into(),
        }
    }

    /// Reader for the queue of `user` on the host described by `entry`.
    pub fn for_host(entry: &HostEntry, user: &str, hostname: &str) -> Result<Self, MonitorError> {
        let vars = HashMap::from([("user", user), ("host", hostname)]);
        let command = render_command(entry.queue_command(), &vars)?;
        Ok(Self::new(entry.scheduler, command))
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn fetch_raw(
        &self,
        executor: &dyn CommandExecutor,
    ) -> Result<Vec<String>, MonitorError> {
        debug!("Reading the queue with `{}`", self.command);
        let output = executor.execute(&self.command).await?;
        if !output.success() {
            warn!(
                "`{}` finished with status {:?}: {}",
                self.command,
                output.status,
                output.stderr.join(" ")
            );
        }
        Ok(output.stdout)
    }

    pub fn parse(&self, lines: &[String]) -> Result<QueueStatus, MonitorError> {
        let lines: Vec<&str> = lines
            .iter()
            .map(String::as_str)
            .filter(|line| !line.trim().is_empty())
            .collect();
        // Torque prints a server banner and a multi-line header above a
        // dashed rule, which also gives the column widths.
        if self.scheduler == SchedulerKind::Pbs {
            if let Some(rule) = lines.iter().position(|line| is_rule(line)) {
                return Ok(parse_fixed_width(
                    &lines[..rule],
                    lines[rule],
                    &lines[rule + 1..],
                ));
            }
        }

        let header = match lines.first() {
            Some(header) => *header,
            None => return Ok(QueueStatus::Empty),
        };
        let fields = self.scheduler.split(header);
        if fields.iter().all(|field| field.trim().is_empty()) {
            return Err(MonitorError::QueueParse(format!(
                "header line has no column names: {:?}",
                header
            )));
        }

        let mut rows = Vec::new();
        for (line_number, line) in lines[1..].iter().enumerate() {
            let values = self.scheduler.split(line);
            if values.len() > fields.len() {
                return Err(MonitorError::QueueParse(format!(
                    "row {} has {} fields but the header has {}",
                    line_number + 1,
                    values.len(),
                    fields.len()
                )));
            }
            rows.push(values.iter().map(|v| v.trim().to_owned()).collect());
        }
        let columns = fields.iter().map(|f| f.trim().to_owned()).collect();
        Ok(build_status(columns, rows))
    }

    pub async fn read(&self, executor: &dyn CommandExecutor) -> Result<QueueStatus, MonitorError> {
        let lines = self.fetch_raw(executor).await?;
        self.parse(&lines)
    }
}

/// Duplicated column names keep their first occurrence only; short rows are
/// padded with empty values.
fn build_status(fields: Vec<String>, rows: Vec<Vec<String>>) -> QueueStatus {
    if rows.is_empty() {
        return QueueStatus::Empty;
    }
    let mut seen = HashSet::new();
    let mut keep = Vec::with_capacity(fields.len());
    let mut columns = Vec::with_capacity(fields.len());
    for (index, name) in fields.into_iter().enumerate() {
        if seen.insert(name.clone()) {
            keep.push(index);
            columns.push(name);
        }
    }
    let rows = rows
        .into_iter()
        .map(|values| {
            keep.iter()
                .map(|&i| values.get(i).cloned().unwrap_or_default())
                .collect()
        })
        .collect();
    QueueStatus::Jobs(QueueTable { columns, rows })
}

/// `---- ----- --`
fn is_rule(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("--") && line.chars().all(|c| c == '-' || c == ' ')
}

/// Byte offsets where each dashed run of the rule starts.
fn rule_starts(rule: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut previous = ' ';
    for (index, c) in rule.char_indices() {
        if c == '-' && previous != '-' {
            starts.push(index);
        }
        previous = c;
    }
    starts
}

fn cut(line: &str, start: usize, end: Option<usize>) -> &str {
    let end = end.unwrap_or(line.len()).min(line.len());
    if start >= end {
        return "";
    }
    line.get(start..end).unwrap_or_default().trim()
}

fn parse_fixed_width(header: &[&str], rule: &str, rows: &[&str]) -> QueueStatus {
    let starts = rule_starts(rule);
    let spans: Vec<(usize, Option<usize>)> = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| (start, starts.get(i + 1).copied()))
        .collect();
    // Lines ending in `:` name the server, not a column.
    let header: Vec<&str> = header
        .iter()
        .copied()
        .filter(|line| !line.trim_end().ends_with(':'))
        .collect();
    let columns = spans
        .iter()
        .map(|&(start, end)| {
            header
                .iter()
                .map(|line| cut(line, start, end))
                .filter(|part| !part.is_empty())
                .join(" ")
        })
        .collect();
    let rows = rows
        .iter()
        .map(|line| {
            spans
                .iter()
                .map(|&(start, end)| cut(line, start, end).to_owned())
                .collect()
        })
        .collect();
    build_status(columns, rows)
}
