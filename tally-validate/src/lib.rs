use tally_types::{Stage, StepResult, TraceStatus, TraceStep, ValidationReport, ValidationViolation};

/// Null rate must stay strictly below this.
pub const NULL_RATE_CEILING: f64 = 0.95;
/// Rows per step sampled for the null rate.
pub const NULL_SAMPLE_ROWS: usize = 200;

/// Aggregate integrity gate over the executed steps. Blocked steps are ignored;
/// checks stop at the first failure.
pub fn validate(results: &[StepResult], max_row_limit: u64) -> ValidationReport {
    let executed: Vec<&StepResult> = results.iter().filter(|r| !r.is_blocked()).collect();
    let mut checks = Vec::new();

    if executed.is_empty() {
        checks.push("No SQL steps were executed.".to_string());
        return failed(ValidationViolation::NoStepsExecuted, checks, None);
    }
    checks.push(format!("Executed {} governed SQL step(s).", executed.len()));

    let total_rows: usize = executed.iter().map(|r| r.row_count).sum();
    checks.push(format!("Total retrieved rows: {total_rows}."));
    if total_rows == 0 {
        checks.push("No rows returned from SQL steps.".to_string());
        return failed(ValidationViolation::EmptyResultSet, checks, None);
    }

    if let Some(over) = executed.iter().find(|r| r.row_count as u64 > max_row_limit) {
        checks.push(format!(
            "{} returned {} rows, above the limit of {max_row_limit}.",
            over.step_id, over.row_count
        ));
        return failed(ValidationViolation::RowLimitViolation, checks, None);
    }
    checks.push("All SQL steps satisfy row-limit policy.".to_string());

    let (nulls, values) = executed
        .iter()
        .flat_map(|r| r.rows.iter().take(NULL_SAMPLE_ROWS))
        .flat_map(|row| row.values())
        .fold((0usize, 0usize), |(n, v), value| (n + usize::from(value.is_null()), v + 1));
    let null_rate = if values == 0 { 1.0 } else { nulls as f64 / values as f64 };
    checks.push(format!("Observed null-rate: {:.2}%.", null_rate * 100.0));
    if null_rate >= NULL_RATE_CEILING {
        return failed(ValidationViolation::ExcessiveNulls, checks, Some(null_rate));
    }
    checks.push("Restricted-column access prevented by SQL guard.".to_string());

    ValidationReport {
        passed: true,
        violations: Vec::new(),
        checks,
        null_rate: Some(null_rate),
    }
}

fn failed(violation: ValidationViolation, checks: Vec<String>, null_rate: Option<f64>) -> ValidationReport {
    tracing::warn!(violation = violation.as_str(), "validation failed");
    ValidationReport {
        passed: false,
        violations: vec![violation],
        checks,
        null_rate,
    }
}

pub fn validation_trace(report: &ValidationReport) -> TraceStep {
    let summary = if report.passed {
        "Results passed integrity checks.".to_string()
    } else {
        let codes: Vec<&str> = report.violations.iter().map(|v| v.as_str()).collect();
        format!("Result validation failed: {}.", codes.join(", "))
    };
    TraceStep {
        id: "t3".into(),
        stage: Stage::Validate,
        title: "Validate results".into(),
        status: if report.passed {
            TraceStatus::Done
        } else {
            TraceStatus::Blocked
        },
        summary,
        sql: None,
        quality_checks: Some(report.checks.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tally_types::{PlanStep, Row, StepOutcome};

    fn step(id: &str, rows: Vec<Value>) -> StepResult {
        let rows: Vec<Row> = rows.into_iter().map(|v| v.as_object().cloned().unwrap()).collect();
        StepResult::executed(&PlanStep::new(id, "g"), "SELECT 1".into(), rows, StepOutcome::Executed)
    }

    fn blocked(id: &str) -> StepResult {
        StepResult::blocked(&PlanStep::new(id, "g"), None, "table_not_allowed: x")
    }

    #[test]
    fn all_blocked_is_no_steps_executed() {
        let r = validate(&[blocked("step_1"), blocked("step_2")], 100);
        assert!(!r.passed);
        assert_eq!(r.violations, vec![ValidationViolation::NoStepsExecuted]);
        assert_eq!(validation_trace(&r).status, TraceStatus::Blocked);
    }

    #[test]
    fn empty_rows_fail() {
        let r = validate(&[step("step_1", vec![])], 100);
        assert_eq!(r.violations, vec![ValidationViolation::EmptyResultSet]);
    }

    #[test]
    fn row_limit_is_checked_before_nulls() {
        let rows = (0..5).map(|_| json!({"a": null})).collect();
        let r = validate(&[step("step_1", rows)], 3);
        assert_eq!(r.violations, vec![ValidationViolation::RowLimitViolation]);
    }

    #[test]
    fn null_rate_at_ceiling_fails() {
        let mut rows: Vec<Value> = (0..19).map(|_| json!({"a": null})).collect();
        rows.push(json!({"a": 1}));
        let r = validate(&[step("step_1", rows)], 1000);
        assert_eq!(r.violations, vec![ValidationViolation::ExcessiveNulls]);
        assert_eq!(r.null_rate, Some(0.95));
    }

    #[test]
    fn blocked_steps_are_ignored_when_others_pass() {
        let r = validate(
            &[blocked("step_1"), step("step_2", vec![json!({"state": "CA", "sales": 3})])],
            1000,
        );
        assert!(r.passed);
        assert_eq!(r.null_rate, Some(0.0));
        assert_eq!(validation_trace(&r).status, TraceStatus::Done);
    }
}
