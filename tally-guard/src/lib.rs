//! Read-only policy gate applied to every candidate query before execution.
//!
//! [`guard`] is pure: it never touches the network and gives the same verdict
//! for the same SQL and catalog.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tally_catalog::PolicyCatalog;

mod scan;

use scan::{scrub, tokenize, TokKind, Token};

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "drop", "truncate", "alter", "grant", "revoke",
    "create",
];

/// Words after which an opening paren is not a function call.
const NON_CALL_WORDS: &[&str] = &[
    "from", "join", "in", "exists", "as", "on", "and", "or", "not", "select", "where", "having",
    "union", "intersect", "except", "all", "any", "some", "lateral", "values", "with",
    "recursive", "by", "then", "else", "when", "distinct", "using",
];

/// Words that end a FROM list item instead of aliasing it.
const CLAUSE_WORDS: &[&str] = &[
    "where", "group", "order", "having", "limit", "join", "inner", "left", "right", "full",
    "cross", "natural", "outer", "on", "using", "union", "intersect", "except", "qualify",
    "window", "fetch", "offset", "lateral", "sample", "tablesample", "pivot", "unpivot",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardViolation {
    NotReadOnly,
    ForbiddenStatement,
    TableNotAllowed,
    RestrictedColumn,
}

impl GuardViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardViolation::NotReadOnly => "not_read_only",
            GuardViolation::ForbiddenStatement => "forbidden_statement",
            GuardViolation::TableNotAllowed => "table_not_allowed",
            GuardViolation::RestrictedColumn => "restricted_column",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GuardVerdict {
    Pass,
    Fail {
        violation: GuardViolation,
        detail: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LimitAction {
    Appended { applied: u64 },
    /// `requested` is `None` for `LIMIT ALL` or a literal too large to represent.
    Clamped { requested: Option<u64>, applied: u64 },
    /// A fractional, parameterized or expression limit rewritten to a plain integer.
    Replaced { requested: String, applied: u64 },
    Kept { limit: u64 },
}

/// A candidate query after policy evaluation. `limited_sql` is set only on pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardedQuery {
    pub raw_sql: String,
    pub verdict: GuardVerdict,
    pub limited_sql: Option<String>,
    pub limit: Option<LimitAction>,
}

impl GuardedQuery {
    fn fail(raw: &str, violation: GuardViolation, detail: impl Into<String>) -> Self {
        Self {
            raw_sql: raw.to_string(),
            verdict: GuardVerdict::Fail {
                violation,
                detail: detail.into(),
            },
            limited_sql: None,
            limit: None,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self.verdict, GuardVerdict::Pass)
    }

    /// The executable SQL, if the query passed.
    pub fn sql(&self) -> Option<&str> {
        self.limited_sql.as_deref()
    }

    pub fn violation(&self) -> Option<GuardViolation> {
        match &self.verdict {
            GuardVerdict::Pass => None,
            GuardVerdict::Fail { violation, .. } => Some(*violation),
        }
    }

    /// `"<code>: <detail>"` for a failed verdict.
    pub fn denial(&self) -> Option<String> {
        match &self.verdict {
            GuardVerdict::Pass => None,
            GuardVerdict::Fail { violation, detail } => {
                Some(format!("{}: {detail}", violation.as_str()))
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardOptions {
    /// Rewrite `db.schema.table` to `table` when `table` is in the catalog.
    pub resolve_qualified_names: bool,
}

pub fn guard(sql: &str, catalog: &PolicyCatalog) -> GuardedQuery {
    guard_with(sql, catalog, &GuardOptions::default())
}

pub fn guard_with(sql: &str, catalog: &PolicyCatalog, opts: &GuardOptions) -> GuardedQuery {
    let scrubbed = scrub(sql);
    let tokens = tokenize(&scrubbed.masked);
    let src = scrubbed.masked.as_str();

    let starts_ok = tokens
        .first()
        .map(|t| t.is_word(src, "select") || t.is_word(src, "with"))
        .unwrap_or(false);
    if !starts_ok {
        return GuardedQuery::fail(sql, GuardViolation::NotReadOnly, "query must start with SELECT or WITH");
    }

    if scrubbed.unterminated {
        return GuardedQuery::fail(
            sql,
            GuardViolation::ForbiddenStatement,
            "unterminated string literal or identifier",
        );
    }
    if let Some(detail) = forbidden_statement(src, &tokens) {
        return GuardedQuery::fail(sql, GuardViolation::ForbiddenStatement, detail);
    }

    let refs = table_refs(src, &tokens);
    if refs.is_empty() {
        return GuardedQuery::fail(
            sql,
            GuardViolation::TableNotAllowed,
            "query references no catalog table",
        );
    }
    let ctes = cte_names(src, &tokens);
    let mut rewrites: Vec<(usize, usize, String)> = Vec::new();
    let mut blocked: Vec<String> = Vec::new();
    for r in &refs {
        let full = r.parts.join(".");
        if r.parts.len() == 1 && ctes.contains(&full) {
            continue;
        }
        if catalog.is_table_allowed(&full) {
            continue;
        }
        let last = r.parts.last().map(String::as_str).unwrap_or_default();
        if r.parts.len() > 1 && opts.resolve_qualified_names && catalog.is_table_allowed(last) {
            rewrites.push((r.start, r.end, last.to_string()));
            continue;
        }
        if !blocked.contains(&full) {
            blocked.push(full);
        }
    }
    if !blocked.is_empty() {
        return GuardedQuery::fail(
            sql,
            GuardViolation::TableNotAllowed,
            format!("non-allowlisted table(s): {}", blocked.join(", ")),
        );
    }

    // Rewriting shifts offsets, so scan again afterwards.
    let (text, masked, tokens) = if rewrites.is_empty() {
        (scrubbed.text, scrubbed.masked.clone(), tokens)
    } else {
        let rewritten = splice(&scrubbed.text, rewrites);
        let again = scrub(&rewritten);
        let toks = tokenize(&again.masked);
        (again.text, again.masked, toks)
    };

    if let Some(column) = restricted_column(&masked, &tokens, catalog) {
        return GuardedQuery::fail(
            sql,
            GuardViolation::RestrictedColumn,
            format!("restricted column referenced: {column}"),
        );
    }

    let (limited_sql, action) = enforce_limit(&text, &masked, &tokens, catalog);
    GuardedQuery {
        raw_sql: sql.to_string(),
        verdict: GuardVerdict::Pass,
        limited_sql: Some(limited_sql),
        limit: Some(action),
    }
}

fn forbidden_statement(src: &str, tokens: &[Token]) -> Option<String> {
    for (i, t) in tokens.iter().enumerate() {
        if t.is_punct(';') && tokens[i + 1..].iter().any(|n| !n.is_punct(';')) {
            return Some("multiple statements are not allowed".into());
        }
        if t.kind == TokKind::Word {
            let word = t.raw(src).to_ascii_lowercase();
            if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                return Some(format!("forbidden keyword: {word}"));
            }
        }
    }
    None
}

/// Names introduced by `WITH name AS (` or `, name AS (`.
fn cte_names(src: &str, tokens: &[Token]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for w in tokens.windows(4) {
        let [lead, name, as_kw, open] = w else { continue };
        let lead_ok =
            lead.is_word(src, "with") || lead.is_word(src, "recursive") || lead.is_punct(',');
        if lead_ok && as_kw.is_word(src, "as") && open.is_punct('(') {
            if let Some(n) = name.name(src) {
                names.insert(n);
            }
        }
    }
    names
}

#[derive(Debug)]
struct TableRef {
    parts: Vec<String>,
    start: usize,
    end: usize,
}

fn is_call_paren(src: &str, tokens: &[Token], open: usize) -> bool {
    let Some(prev) = open.checked_sub(1).map(|i| &tokens[i]) else {
        return false;
    };
    let prev_is_function = match prev.kind {
        TokKind::Word => !NON_CALL_WORDS.contains(&prev.raw(src).to_ascii_lowercase().as_str()),
        TokKind::Quoted => true,
        _ => false,
    };
    let opens_query = tokens
        .get(open + 1)
        .map(|n| n.is_word(src, "select") || n.is_word(src, "with"))
        .unwrap_or(false);
    prev_is_function && !opens_query
}

/// Collects FROM/JOIN targets outside function-call parens such as `EXTRACT(YEAR FROM d)`.
fn table_refs(src: &str, tokens: &[Token]) -> Vec<TableRef> {
    let mut refs = Vec::new();
    let mut parens: Vec<bool> = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        match t.kind {
            TokKind::Punct('(') => parens.push(is_call_paren(src, tokens, i)),
            TokKind::Punct(')') => {
                parens.pop();
            }
            TokKind::Word => {
                if parens.last().copied().unwrap_or(false) {
                    continue;
                }
                let is_from = t.is_word(src, "from");
                if !is_from && !t.is_word(src, "join") {
                    continue;
                }
                // IS [NOT] DISTINCT FROM
                if is_from && i > 0 && tokens[i - 1].is_word(src, "distinct") {
                    continue;
                }
                read_from_list(src, tokens, i + 1, is_from, &mut refs);
            }
            _ => {}
        }
    }
    refs
}

fn read_from_list(src: &str, tokens: &[Token], mut i: usize, is_from: bool, out: &mut Vec<TableRef>) {
    loop {
        while tokens.get(i).is_some_and(|t| t.is_word(src, "lateral") || t.is_word(src, "only")) {
            i += 1;
        }
        let Some(first) = tokens.get(i) else { return };
        if first.is_punct('(') {
            // Derived table; its body is scanned by the caller.
            i = skip_group(tokens, i);
        } else if matches!(first.kind, TokKind::Word | TokKind::Quoted) {
            let mut parts = Vec::new();
            let start = first.start;
            let mut end = first.end;
            while let Some(part) = tokens.get(i) {
                match part.name(src) {
                    Some(name) => parts.push(name),
                    None => break,
                }
                end = part.end;
                i += 1;
                if tokens.get(i).is_some_and(|t| t.is_punct('.')) {
                    i += 1;
                } else {
                    break;
                }
            }
            out.push(TableRef { parts, start, end });
        } else {
            return;
        }

        // optional alias
        if tokens.get(i).is_some_and(|t| t.is_word(src, "as")) {
            i += 2;
        } else if let Some(t) = tokens.get(i) {
            let bare_alias = match t.kind {
                TokKind::Word => !CLAUSE_WORDS.contains(&t.raw(src).to_ascii_lowercase().as_str()),
                TokKind::Quoted => true,
                _ => false,
            };
            if bare_alias {
                i += 1;
            }
        }

        if is_from && tokens.get(i).is_some_and(|t| t.is_punct(',')) {
            i += 1;
            continue;
        }
        return;
    }
}

/// Index just past the paren group opening at `open`.
fn skip_group(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return i + 1;
            }
        }
    }
    tokens.len()
}

fn restricted_column(src: &str, tokens: &[Token], catalog: &PolicyCatalog) -> Option<String> {
    let restricted: Vec<String> = catalog
        .restricted_columns()
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if restricted.is_empty() {
        return None;
    }
    tokens
        .iter()
        .filter_map(|t| t.name(src))
        .find(|name| restricted.contains(name))
}

/// What follows a `LIMIT` keyword.
#[derive(Debug, PartialEq)]
enum LimitArg {
    Int(u64),
    /// `ALL`, `NULL` or an integer literal that overflows.
    Unbounded,
    /// Floor of a non-integer numeric literal.
    Fraction(u64),
    /// Missing, parameterized or an expression.
    Other,
}

fn limit_arg(src: &str, arg: &[Token]) -> LimitArg {
    let [tok] = arg else { return LimitArg::Other };
    match tok.kind {
        TokKind::Number => {
            let raw = tok.raw(src);
            if let Ok(n) = raw.parse::<u64>() {
                return LimitArg::Int(n);
            }
            if raw.bytes().all(|b| b.is_ascii_digit()) {
                return LimitArg::Unbounded;
            }
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() && v < u64::MAX as f64 => LimitArg::Fraction(v.floor() as u64),
                Ok(v) if v.is_finite() => LimitArg::Unbounded,
                _ => LimitArg::Other,
            }
        }
        TokKind::Word if tok.is_word(src, "all") || tok.is_word(src, "null") => LimitArg::Unbounded,
        _ => LimitArg::Other,
    }
}

/// Token index just past the argument of the `LIMIT` whose argument starts at `i`.
fn limit_arg_end(src: &str, tokens: &[Token], i: usize) -> usize {
    let Some(first) = tokens.get(i) else { return i };
    match first.kind {
        TokKind::Punct('(') => skip_group(tokens, i),
        // `?`, `:n`, `$1`, `-1`
        TokKind::Punct(c) if matches!(c, '?' | ':' | '$' | '@' | '-' | '+') => {
            match tokens.get(i + 1) {
                Some(next)
                    if next.start == first.end
                        && matches!(next.kind, TokKind::Word | TokKind::Number)
                        && !next.is_word(src, "offset") =>
                {
                    i + 2
                }
                _ => i + 1,
            }
        }
        TokKind::Punct(_) => i,
        TokKind::Word if first.is_word(src, "offset") => i,
        _ => i + 1,
    }
}

fn enforce_limit(
    text: &str,
    masked: &str,
    tokens: &[Token],
    catalog: &PolicyCatalog,
) -> (String, LimitAction) {
    let max = catalog.max_row_limit();
    let default = catalog.default_row_limit().min(max);
    let mut depth = 0usize;
    let mut top_level: Option<LimitAction> = None;
    let mut nested: Option<LimitAction> = None;
    let mut rewrites = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        i += 1;
        if t.is_punct('(') {
            depth += 1;
            continue;
        }
        if t.is_punct(')') {
            depth = depth.saturating_sub(1);
            continue;
        }
        if !t.is_word(masked, "limit") {
            continue;
        }

        let end = limit_arg_end(masked, tokens, i);
        let (start, stop) = match (tokens.get(i), end.checked_sub(1).and_then(|e| tokens.get(e))) {
            (Some(first), Some(last)) if end > i => (first.start, last.end),
            _ => (t.end, t.end),
        };
        let action = match limit_arg(masked, &tokens[i..end]) {
            LimitArg::Int(n) if n <= max => LimitAction::Kept { limit: n },
            LimitArg::Int(n) | LimitArg::Fraction(n) if n > max => LimitAction::Clamped {
                requested: Some(n),
                applied: max,
            },
            LimitArg::Unbounded => LimitAction::Clamped {
                requested: None,
                applied: max,
            },
            LimitArg::Fraction(n) => LimitAction::Replaced {
                requested: text[start..stop].to_string(),
                applied: n,
            },
            LimitArg::Int(_) | LimitArg::Other => LimitAction::Replaced {
                requested: text[start..stop].trim().to_string(),
                applied: default,
            },
        };
        match &action {
            LimitAction::Kept { .. } | LimitAction::Appended { .. } => {}
            LimitAction::Clamped { applied, .. } | LimitAction::Replaced { applied, .. } => {
                let with = if start == stop {
                    format!(" {applied}")
                } else {
                    applied.to_string()
                };
                rewrites.push((start, stop, with));
            }
        }
        if depth == 0 {
            top_level = Some(action);
        } else if nested.is_none() && !matches!(action, LimitAction::Kept { .. }) {
            nested = Some(action);
        }
        i = end;
    }

    let rewritten = splice(text, rewrites);
    let base = rewritten
        .trim_end()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .trim_start()
        .to_string();
    match (top_level, nested) {
        (None, _) => {
            let applied = catalog.default_row_limit();
            (format!("{base}\nLIMIT {applied}"), LimitAction::Appended { applied })
        }
        (Some(LimitAction::Kept { .. }), Some(inner)) => (base, inner),
        (Some(action), _) => (base, action),
    }
}

fn splice(text: &str, mut rewrites: Vec<(usize, usize, String)>) -> String {
    rewrites.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out = text.to_string();
    for (start, end, with) in rewrites {
        out.replace_range(start..end, &with);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PolicyCatalog {
        PolicyCatalog::from_json_str(
            r#"{
                "version": "1",
                "tables": [
                    {"name": "sales", "dimensions": ["state", "store_id", "sale_date"], "metrics": ["revenue"]},
                    {"name": "stores", "dimensions": ["store_id", "city"]}
                ],
                "policy": {"restrictedColumns": ["customer_email"], "defaultRowLimit": 1000, "maxRowLimit": 5000}
            }"#,
        )
        .unwrap()
    }

    fn violation(sql: &str) -> Option<GuardViolation> {
        guard(sql, &catalog()).violation()
    }

    fn limit_count(sql: &str) -> usize {
        sql.to_ascii_lowercase().matches("limit").count()
    }

    #[test]
    fn plain_select_passes_with_default_limit() {
        let g = guard("SELECT state, SUM(revenue) FROM sales GROUP BY state", &catalog());
        assert!(g.passed());
        let sql = g.sql().unwrap();
        assert!(sql.ends_with("\nLIMIT 1000"));
        assert_eq!(limit_count(sql), 1);
        assert_eq!(g.limit, Some(LimitAction::Appended { applied: 1000 }));
    }

    #[test]
    fn trailing_semicolon_is_trimmed_before_append() {
        let g = guard("SELECT * FROM sales;  \n", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT * FROM sales\nLIMIT 1000");
    }

    #[test]
    fn disallowed_table_regardless_of_casing_or_comments() {
        for sql in [
            "SELECT * FROM payroll",
            "select * from PAYROLL",
            "SeLeCt * FrOm/* hide */payroll",
            "SELECT * FROM sales -- fine\n JOIN \"Payroll\" p ON p.id = sales.store_id",
            "SELECT * FROM sales s, payroll p",
            "SELECT * FROM (SELECT * FROM payroll) x",
            "SELECT * FROM hr.payroll",
        ] {
            assert_eq!(violation(sql), Some(GuardViolation::TableNotAllowed), "{sql}");
        }
    }

    #[test]
    fn non_select_is_not_read_only() {
        assert_eq!(violation(""), Some(GuardViolation::NotReadOnly));
        assert_eq!(violation("   "), Some(GuardViolation::NotReadOnly));
        assert_eq!(
            violation("-- comment\nDROP TABLE sales"),
            Some(GuardViolation::NotReadOnly)
        );
        assert_eq!(violation("EXPLAIN SELECT 1"), Some(GuardViolation::NotReadOnly));
    }

    #[test]
    fn stacked_statement_is_forbidden() {
        let g = guard("SELECT * FROM sales; DROP TABLE sales;", &catalog());
        assert_eq!(g.violation(), Some(GuardViolation::ForbiddenStatement));
        assert!(g.sql().is_none());
        assert!(g.denial().unwrap().starts_with("forbidden_statement"));
    }

    #[test]
    fn mutation_keywords_in_literals_are_ignored() {
        let g = guard("SELECT * FROM sales WHERE state = 'DELETE; DROP'", &catalog());
        assert!(g.passed(), "{:?}", g.verdict);
        assert!(g.sql().unwrap().contains("'DELETE; DROP'"));
    }

    #[test]
    fn mutation_keyword_outside_literal_is_forbidden() {
        assert_eq!(
            violation("WITH x AS (DELETE FROM sales RETURNING *) SELECT * FROM x"),
            Some(GuardViolation::ForbiddenStatement)
        );
    }

    #[test]
    fn cte_names_are_accepted() {
        let sql = "WITH scoped AS (\n  SELECT store_id, revenue FROM sales\n),\nagg AS (SELECT SUM(revenue) AS total FROM scoped)\nSELECT total FROM agg";
        let g = guard(sql, &catalog());
        assert!(g.passed(), "{:?}", g.verdict);
        assert!(g.sql().unwrap().contains("FROM sales"));
    }

    #[test]
    fn extract_from_is_not_a_table_reference() {
        let g = guard(
            "SELECT EXTRACT(YEAR FROM sale_date) AS yr, SUM(revenue) FROM sales GROUP BY 1",
            &catalog(),
        );
        assert!(g.passed(), "{:?}", g.verdict);
    }

    #[test]
    fn query_without_tables_fails() {
        assert_eq!(violation("SELECT 1"), Some(GuardViolation::TableNotAllowed));
    }

    #[test]
    fn restricted_column_is_caught() {
        assert_eq!(
            violation("SELECT s.customer_email FROM sales s"),
            Some(GuardViolation::RestrictedColumn)
        );
        assert_eq!(
            violation("SELECT \"CUSTOMER_EMAIL\" FROM sales"),
            Some(GuardViolation::RestrictedColumn)
        );
        // mentioned only inside a literal
        assert!(guard("SELECT 'customer_email' AS label FROM sales", &catalog()).passed());
    }

    #[test]
    fn limit_above_max_is_clamped_never_raised() {
        let g = guard("SELECT * FROM sales LIMIT 999999", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT * FROM sales LIMIT 5000");
        assert_eq!(
            g.limit,
            Some(LimitAction::Clamped {
                requested: Some(999999),
                applied: 5000
            })
        );

        let g = guard("SELECT * FROM sales LIMIT 10", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT * FROM sales LIMIT 10");
        assert_eq!(g.limit, Some(LimitAction::Kept { limit: 10 }));
    }

    #[test]
    fn fractional_limit_is_floored_not_raised() {
        let g = guard("SELECT state FROM sales LIMIT 10.5", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT state FROM sales LIMIT 10");
        assert_eq!(
            g.limit,
            Some(LimitAction::Replaced {
                requested: "10.5".into(),
                applied: 10
            })
        );

        let g = guard("SELECT state FROM sales LIMIT 7500.9", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT state FROM sales LIMIT 5000");
        assert_eq!(
            g.limit,
            Some(LimitAction::Clamped {
                requested: Some(7500),
                applied: 5000
            })
        );
    }

    #[test]
    fn oversized_limit_literal_is_clamped_without_a_bogus_request() {
        let g = guard("SELECT state FROM sales LIMIT 99999999999999999999999", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT state FROM sales LIMIT 5000");
        assert_eq!(
            g.limit,
            Some(LimitAction::Clamped {
                requested: None,
                applied: 5000
            })
        );
    }

    #[test]
    fn non_literal_limit_is_replaced_in_place() {
        for (sql, requested) in [
            ("SELECT state FROM sales LIMIT ?", "?"),
            ("SELECT state FROM sales LIMIT :n", ":n"),
            ("SELECT state FROM sales LIMIT (10)", "(10)"),
            ("SELECT state FROM sales LIMIT -1", "-1"),
            ("SELECT state FROM sales LIMIT row_cap", "row_cap"),
        ] {
            let g = guard(sql, &catalog());
            assert!(g.passed(), "{sql}");
            let out = g.sql().unwrap();
            assert_eq!(limit_count(out), 1, "{out}");
            assert_eq!(out, "SELECT state FROM sales LIMIT 1000", "{sql}");
            assert_eq!(
                g.limit,
                Some(LimitAction::Replaced {
                    requested: requested.into(),
                    applied: 1000
                }),
                "{sql}"
            );
        }
    }

    #[test]
    fn bare_limit_gets_an_argument_instead_of_a_second_clause() {
        let g = guard("SELECT state FROM sales LIMIT;", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT state FROM sales LIMIT 1000");
        let g = guard("SELECT state FROM sales LIMIT OFFSET 5", &catalog());
        assert_eq!(g.sql().unwrap(), "SELECT state FROM sales LIMIT 1000 OFFSET 5");
    }

    #[test]
    fn subquery_limit_does_not_count_as_top_level() {
        let g = guard(
            "SELECT * FROM (SELECT * FROM sales LIMIT 9000) t",
            &catalog(),
        );
        let sql = g.sql().unwrap();
        assert!(sql.contains("LIMIT 5000)"));
        assert!(sql.ends_with("\nLIMIT 1000"));
    }

    #[test]
    fn qualified_names_resolve_only_when_enabled() {
        let sql = "SELECT SUM(revenue) AS total FROM prod_db.retail.sales";
        assert_eq!(violation(sql), Some(GuardViolation::TableNotAllowed));

        let opts = GuardOptions {
            resolve_qualified_names: true,
        };
        let g = guard_with(sql, &catalog(), &opts);
        assert!(g.passed());
        let out = g.sql().unwrap();
        assert!(out.contains("FROM sales"));
        assert!(!out.contains("prod_db"));
    }

    #[test]
    fn guarded_query_serializes_verdict() {
        let g = guard("SELECT * FROM payroll", &catalog());
        let json = serde_json::to_value(&g).unwrap();
        assert_eq!(json["verdict"]["verdict"], "fail");
        assert_eq!(json["verdict"]["violation"], "table_not_allowed");
    }
}
