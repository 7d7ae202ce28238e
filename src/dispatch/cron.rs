//! Cron expression parsing and the per-schedule recurring timer.
//!
//! Accepts the classic 5-field form (`minute hour day-of-month month day-of-week`),
//! a 6-field form with a leading seconds field, and the `@daily`-style shortcuts.
//! Expressions are evaluated in local wall-clock time.

use chrono::{DateTime, Local, TimeZone};
use cron::Schedule as CronSchedule;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::IndexWatchError;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A validated cron expression
#[derive(Clone)]
pub struct CronExpr {
    expression: String,
    // Two schedules when both day fields are restricted: a day matches if either matches
    schedules: Vec<CronSchedule>,
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.expression).finish()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronExpr {
    type Err = IndexWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, IndexWatchError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(IndexWatchError::invalid_cron(expression, "expression is empty"));
        }

        let expanded = if trimmed.starts_with('@') {
            Self::expand_shortcut(trimmed)?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(IndexWatchError::invalid_cron(
                    expression,
                    format!("expected 5 or 6 fields, got {}", n),
                ))
            }
        };

        let minute = rest[0];
        let hour = rest[1];
        let day_of_month = rest[2];
        let month = rest[3].to_ascii_uppercase();
        let day_of_week = translate_day_of_week(expression, rest[4])?;

        let build = |dom: &str, dow: &str| -> Result<CronSchedule, IndexWatchError> {
            let normalized = format!("{} {} {} {} {} {}", seconds, minute, hour, dom, month, dow);
            CronSchedule::from_str(&normalized)
                .map_err(|e| IndexWatchError::invalid_cron(expression, e.to_string()))
        };

        let schedules = if !starts_unrestricted(day_of_month) && !starts_unrestricted(rest[4]) {
            vec![build(day_of_month, "*")?, build("*", &day_of_week)?]
        } else {
            vec![build(day_of_month, &day_of_week)?]
        };

        let cron_expr = CronExpr {
            expression: trimmed.to_string(),
            schedules,
        };

        // e.g. "0 0 31 2 *" parses but never fires
        if cron_expr.next_after(&Local::now()).is_none() {
            return Err(IndexWatchError::invalid_cron(expression, "expression never fires"));
        }

        Ok(cron_expr)
    }

    fn expand_shortcut(shortcut: &str) -> Result<&'static str, IndexWatchError> {
        match shortcut.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => Ok("0 0 1 1 *"),
            "@monthly" => Ok("0 0 1 * *"),
            "@weekly" => Ok("0 0 * * 0"),
            "@daily" | "@midnight" => Ok("0 0 * * *"),
            "@hourly" => Ok("0 * * * *"),
            _ => Err(IndexWatchError::invalid_cron(shortcut, "unknown shortcut")),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching instant strictly after `after`
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }

    pub fn upcoming(&self, from: DateTime<Local>, count: usize) -> Vec<DateTime<Local>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = from;
        while times.len() < count {
            match self.next_after(&cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

// Classic cron ORs the day fields only when neither starts with '*', so "*/2" still ANDs
fn starts_unrestricted(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

/// Rewrite a classic day-of-week field (0-7, 0 and 7 = Sunday) into explicit day names,
/// which the `cron` crate interprets unambiguously.
fn translate_day_of_week(expression: &str, field: &str) -> Result<String, IndexWatchError> {
    if !is_restricted(field) {
        return Ok(field.to_string());
    }

    let mut days: Vec<usize> = Vec::new();

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step.parse().map_err(|_| {
                    IndexWatchError::invalid_cron(expression, format!("invalid step '{}'", step))
                })?;
                if step == 0 {
                    return Err(IndexWatchError::invalid_cron(expression, "step cannot be zero"));
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((from, to)) = base.split_once('-') {
            (parse_day(expression, from)?, parse_day(expression, to)?)
        } else {
            let day = parse_day(expression, base)?;
            // "N/step" means "N through the end of the week, every step days"
            (day, if step.is_some() { 6 } else { day })
        };

        if start > end {
            return Err(IndexWatchError::invalid_cron(
                expression,
                format!("day-of-week range '{}' runs backwards", base),
            ));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            let day = day % 7;
            if !days.contains(&day) {
                days.push(day);
            }
        }
    }

    Ok(days
        .iter()
        .map(|day| DAY_NAMES[*day])
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_day(expression: &str, token: &str) -> Result<usize, IndexWatchError> {
    if let Ok(day) = token.parse::<usize>() {
        if day > 7 {
            return Err(IndexWatchError::invalid_cron(
                expression,
                format!("day-of-week {} out of range 0-7", day),
            ));
        }
        return Ok(day);
    }

    let upper = token.to_ascii_uppercase();
    DAY_NAMES
        .iter()
        .position(|name| *name == upper)
        .ok_or_else(|| {
            IndexWatchError::invalid_cron(expression, format!("invalid day-of-week '{}'", token))
        })
}

/// Recurring timer for one schedule.
///
/// The timer runs on its own thread and invokes the callback at each matching instant.
/// `stop()` waits for a callback that is already running, and no callback fires after
/// it returns.
pub struct CronDispatcher {
    label: String,
    expr: CronExpr,
    gate: Arc<Mutex<bool>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for CronDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronDispatcher")
            .field("label", &self.label)
            .field("expression", &self.expr.expression())
            .field("running", &self.is_running())
            .finish()
    }
}

impl CronDispatcher {
    pub fn new(label: impl Into<String>, expr: CronExpr) -> Self {
        CronDispatcher {
            label: label.into(),
            expr,
            gate: Arc::new(Mutex::new(false)),
            stop_tx: None,
            handle: None,
        }
    }

    pub fn start<F>(&mut self, on_fire: F) -> Result<(), IndexWatchError>
    where
        F: Fn(DateTime<Local>) + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(IndexWatchError::Error(format!(
                "Cron dispatcher for {} is already started",
                self.label
            )));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = true;

        let gate = Arc::clone(&self.gate);
        let expr = self.expr.clone();
        let label = self.label.clone();

        let handle = thread::Builder::new()
            .name(format!("cron-{}", self.label))
            .spawn(move || {
                let mut last_fired: Option<DateTime<Local>> = None;

                loop {
                    let now = Local::now();
                    // Never hand out the same instant twice if the wait ended a little early
                    let from = match last_fired {
                        Some(fired) if fired > now => fired,
                        _ => now,
                    };

                    let Some(next) = expr.next_after(&from) else {
                        warn!("Cron schedule for {} has no further occurrences", label);
                        return;
                    };

                    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            let open = gate.lock().unwrap_or_else(PoisonError::into_inner);
                            if !*open {
                                return;
                            }
                            debug!("Cron fired for {} ({})", label, next);
                            on_fire(next);
                            last_fired = Some(next);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })?;

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);

        Ok(())
    }

    /// Stop the timer. Idempotent.
    pub fn stop(&mut self) {
        // Closing the gate waits for an in-flight callback to return
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = false;

        // Dropping the sender disconnects the channel and wakes the timer thread
        self.stop_tx.take();

        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Cron timer thread for {} panicked", self.label);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn expr(&self) -> &CronExpr {
        &self.expr
    }
}

impl Drop for CronDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
