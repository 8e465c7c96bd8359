//! Cron schedule validation.

use croner::Cron;

use super::types::Schedule;
use crate::error::{BuildError, BuildErrorKind};

/// Validate each expression as cron and build the schedule list.
pub fn build_schedules(expressions: &[String]) -> Result<Vec<Schedule>, BuildError> {
    let mut schedules = Vec::with_capacity(expressions.len());
    for expression in expressions {
        expression.parse::<Cron>().map_err(|e| {
            BuildError::new(
                "schedule",
                BuildErrorKind::InvalidCron {
                    expression: expression.clone(),
                    message: e.to_string(),
                },
            )
        })?;
        schedules.push(Schedule {
            expression: expression.clone(),
        });
    }
    Ok(schedules)
}
