//! Crons produce workflow instances on a time schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ColonyError, Result};
use crate::types::process::check_span;
use crate::types::workflow::WorkflowSpec;

/// `interval_secs` value meaning "use the cron expression".
pub const USE_EXPRESSION: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cron {
    pub id: String,
    pub colony_name: String,
    pub name: String,
    #[serde(default)]
    pub cron_expression: String,
    pub interval_secs: i64,
    #[serde(default)]
    pub random: bool,
    #[serde(default)]
    pub wait_for_prev_graph: bool,
    pub workflow_spec: WorkflowSpec,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub prev_graph_id: Option<String>,
    pub version: u64,
}

/// Validated form of a cron's timing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronSchedule {
    Expression(String),
    Interval { secs: i64, random: bool },
}

impl Cron {
    pub fn with_expression(name: &str, expression: &str, workflow_spec: WorkflowSpec) -> Self {
        Self::build(name, expression.into(), USE_EXPRESSION, false, workflow_spec)
    }

    pub fn with_interval(name: &str, secs: i64, random: bool, workflow_spec: WorkflowSpec) -> Self {
        Self::build(name, String::new(), secs, random, workflow_spec)
    }

    fn build(
        name: &str,
        cron_expression: String,
        interval_secs: i64,
        random: bool,
        workflow_spec: WorkflowSpec,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            colony_name: workflow_spec.colony_name.clone(),
            name: name.into(),
            cron_expression,
            interval_secs,
            random,
            wait_for_prev_graph: false,
            workflow_spec,
            next_run: None,
            last_run: None,
            prev_graph_id: None,
            version: 0,
        }
    }

    pub fn waiting_for_prev(mut self, wait: bool) -> Self {
        self.wait_for_prev_graph = wait;
        self
    }

    /// Exactly one of interval or expression, and jitter only with an interval.
    pub fn schedule(&self) -> Result<CronSchedule> {
        let has_expr = !self.cron_expression.trim().is_empty();
        match (self.interval_secs, has_expr) {
            (secs, false) if secs > 0 => {
                check_span("interval", secs)?;
                Ok(CronSchedule::Interval {
                    secs,
                    random: self.random,
                })
            }
            (USE_EXPRESSION, true) if self.random => Err(ColonyError::Validation(
                "random is only supported together with an interval".into(),
            )),
            (USE_EXPRESSION, true) => Ok(CronSchedule::Expression(self.cron_expression.trim().to_string())),
            (secs, true) if secs > 0 => Err(ColonyError::Validation(
                "cron expression and interval are mutually exclusive".into(),
            )),
            _ => Err(ColonyError::Validation(format!(
                "cron '{}' needs an interval > 0 or an expression with interval = -1",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf() -> WorkflowSpec {
        WorkflowSpec::new("dev")
    }

    #[test]
    fn test_expression_schedule() {
        let cron = Cron::with_expression("nightly", "0 0 3 * * *", wf());
        assert_eq!(cron.schedule().unwrap(), CronSchedule::Expression("0 0 3 * * *".into()));
    }

    #[test]
    fn test_interval_schedule() {
        let cron = Cron::with_interval("tick", 30, true, wf());
        assert_eq!(cron.schedule().unwrap(), CronSchedule::Interval { secs: 30, random: true });
    }

    #[test]
    fn test_random_with_expression_rejected() {
        let mut cron = Cron::with_expression("c", "@daily", wf());
        cron.random = true;
        assert!(matches!(cron.schedule(), Err(ColonyError::Validation(_))));
    }

    #[test]
    fn test_both_or_neither_rejected() {
        let mut both = Cron::with_interval("c", 10, false, wf());
        both.cron_expression = "@hourly".into();
        assert!(both.schedule().is_err());

        let neither = Cron::with_interval("c", 0, false, wf());
        assert!(neither.schedule().is_err());

        let sentinel_without_expr = Cron::with_interval("c", USE_EXPRESSION, false, wf());
        assert!(sentinel_without_expr.schedule().is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let cron = Cron::with_interval("big", i64::MAX / 2, false, wf());
        assert!(matches!(cron.schedule(), Err(ColonyError::Validation(_))));
    }
}
