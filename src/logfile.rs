//! Experiment run logs.
//!
//! ESM-style compute logs record one line per run state change:
//!
//! ```text
//! Mon Apr  1 12:00:00 CEST 2019 : 3 18520101 4711 - start
//! ```
//!
//! From the start and done entries of each run we derive wall time, time
//! spent queuing in between runs and the resulting throughput.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

const DATE_FORMATS: [&str; 3] = ["%a %b %d %H:%M:%S %Y", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Zone names `date(1)` prints on the hosts we know, as hours east of UTC.
const ZONE_OFFSETS: [(&str, i64); 11] = [
    ("UTC", 0),
    ("GMT", 0),
    ("WET", 0),
    ("BST", 1),
    ("WEST", 1),
    ("CET", 1),
    ("MET", 1),
    ("CEST", 2),
    ("MEST", 2),
    ("EET", 2),
    ("EEST", 3),
];

/// How many of the latest runs the run statistics look at.
const RECENT_RUNS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub date: NaiveDateTime,
    pub run: u32,
    pub exp_date: String,
    pub job_id: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTimes {
    pub run: u32,
    pub wall: Duration,
    pub queue: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    pub mean_wall: Duration,
    pub mean_queue: Duration,
    /// Runs per day if there were no queuing.
    pub optimal_throughput: f64,
    /// Runs per day including queuing.
    pub actual_throughput: f64,
    /// Share of time spent running, in percent.
    pub efficiency: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RunLog {
    entries: Vec<LogEntry>,
}

impl RunLog {
    /// Parses log lines. The first line announces the experiment and is
    /// skipped; lines that do not look like run entries are ignored.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let entries = lines
            .iter()
            .skip(1)
            .filter_map(|line| {
                let entry = parse_entry(line.as_ref());
                if entry.is_none() {
                    debug!("Skipping log line {:?}", line.as_ref());
                }
                entry
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Wall and queue time of every finished run, ordered by run number.
    pub fn run_times(&self) -> Vec<RunTimes> {
        // run -> (last start, last done)
        let mut runs: BTreeMap<u32, (Option<NaiveDateTime>, Option<NaiveDateTime>)> =
            BTreeMap::new();
        for entry in &self.entries {
            let times = runs.entry(entry.run).or_default();
            if entry.state.contains("start") {
                times.0 = Some(entry.date);
            } else if entry.state.contains("done") {
                times.1 = Some(entry.date);
            }
        }

        let mut result = Vec::with_capacity(runs.len());
        for (&run, &(start, done)) in &runs {
            let (start, done) = match (start, done) {
                (Some(start), Some(done)) => (start, done),
                _ => continue,
            };
            let queue = run
                .checked_sub(1)
                .and_then(|previous| runs.get(&previous))
                .and_then(|&(previous_start, previous_done)| previous_done.or(previous_start))
                .map(|previous_end| start - previous_end)
                .unwrap_or_else(Duration::zero);
            result.push(RunTimes {
                run,
                wall: done - start,
                queue,
            });
        }
        result
    }

    /// Runs per day over the whole experiment, assuming no queue time.
    pub fn throughput(&self) -> Option<f64> {
        let times = self.run_times();
        runs_per_day(mean(times.iter().map(|t| t.wall))?)
    }

    /// Statistics over the latest runs.
    pub fn run_stats(&self) -> Option<RunStats> {
        let times = self.run_times();
        let recent = &times[times.len().saturating_sub(RECENT_RUNS)..];
        let mean_wall = mean(recent.iter().map(|t| t.wall))?;
        let mean_queue = mean(recent.iter().map(|t| t.queue))?;
        let optimal_throughput = runs_per_day(mean_wall)?;
        let wall = mean_wall.num_milliseconds() as f64;
        let total = wall + mean_queue.num_milliseconds() as f64;
        let efficiency = if total > 0.0 { wall / total } else { 1.0 };
        Some(RunStats {
            mean_wall,
            mean_queue,
            optimal_throughput,
            actual_throughput: optimal_throughput * efficiency,
            efficiency: efficiency * 100.0,
        })
    }
}

fn parse_entry(line: &str) -> Option<LogEntry> {
    let (date, message) = line.split_once(" : ")?;
    let fields: Vec<&str> = message.split_whitespace().collect();
    if fields.len() < 5 || fields[3] != "-" {
        return None;
    }
    Some(LogEntry {
        date: parse_date(date)?,
        run: fields[0].parse().ok()?,
        exp_date: fields[1].to_owned(),
        job_id: fields[2].to_owned(),
        state: fields[4..].join(" "),
    })
}

/// Accepts `date(1)` output, with or without a timezone name, and ISO dates.
///
/// Dates carrying a zone from [`ZONE_OFFSETS`] are converted to UTC, so runs
/// spanning a daylight saving change get the right duration. Dates without a
/// zone, or with one not in the table, are taken as they are.
pub fn parse_date(date: &str) -> Option<NaiveDateTime> {
    let mut tokens: Vec<&str> = date.split_whitespace().collect();
    let mut offset = Duration::zero();
    if tokens.len() == 6 && tokens[4].chars().all(|c| c.is_ascii_alphabetic()) {
        let zone = tokens.remove(4);
        match ZONE_OFFSETS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(zone))
        {
            Some((_, hours)) => offset = Duration::hours(*hours),
            None => debug!("Unknown timezone {}, using local wall clock time", zone),
        }
    }
    let date = tokens.join(" ");
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&date, format).ok())
        .map(|date| date - offset)
}

fn mean(durations: impl Iterator<Item = Duration>) -> Option<Duration> {
    let (count, total) = durations.fold((0i64, 0i64), |(count, total), d| {
        (count + 1, total + d.num_milliseconds())
    });
    if count == 0 {
        None
    } else {
        Some(Duration::milliseconds(total / count))
    }
}

fn runs_per_day(wall: Duration) -> Option<f64> {
    let millis = wall.num_milliseconds();
    if millis <= 0 {
        return None;
    }
    Some(Duration::days(1).num_milliseconds() as f64 / millis as f64)
}

/// `H:MM:SS`, hours not wrapped at a day.
pub struct Hms(pub Duration);

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let seconds = self.0.num_seconds();
        let sign = if seconds < 0 { "-" } else { "" };
        let seconds = seconds.abs();
        write!(
            f,
            "{}{}:{:02}:{:02}",
            sign,
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}
