use tally_catalog::PolicyCatalog;

/// Deterministic query for a step: first dimension and first metric of the
/// table that best matches the goal.
pub fn template_sql(catalog: &PolicyCatalog, goal: &str) -> Option<String> {
    let table = catalog.table_for_goal(goal)?;
    let sql = match (table.dimensions.first(), table.metrics.first()) {
        (Some(dim), Some(metric)) => format!(
            "SELECT {dim}, SUM({metric}) AS metric_value FROM {} GROUP BY {dim} ORDER BY metric_value DESC",
            table.name
        ),
        (None, Some(metric)) => format!("SELECT SUM({metric}) AS metric_value FROM {}", table.name),
        _ => format!("SELECT * FROM {}", table.name),
    };
    Some(sql)
}
