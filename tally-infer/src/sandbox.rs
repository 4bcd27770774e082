//! Self-contained SQL executor over an embedded SQLite store seeded with
//! deterministic card-transaction data, so a turn can run end to end without a
//! warehouse.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use chrono::{Datelike, Days, Months, NaiveDate};
use regex::Regex;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde_json::{Number, Value};
use tally_types::Row;

use crate::{InferError, SqlExecutor};

const SEED_VERSION: &str = "1";

const STATES: &[(&str, &str)] = &[
    ("CA", "Los Angeles"),
    ("TX", "Dallas"),
    ("FL", "Miami"),
    ("NY", "New York"),
    ("GA", "Atlanta"),
    ("IL", "Chicago"),
    ("PA", "Philadelphia"),
    ("OH", "Columbus"),
    ("NC", "Charlotte"),
    ("MI", "Detroit"),
    ("NJ", "Newark"),
    ("VA", "Richmond"),
    ("WA", "Seattle"),
    ("AZ", "Phoenix"),
    ("MA", "Boston"),
    ("TN", "Nashville"),
    ("IN", "Indianapolis"),
    ("MO", "Kansas City"),
    ("MD", "Baltimore"),
    ("WI", "Milwaukee"),
    ("CO", "Denver"),
    ("MN", "Minneapolis"),
    ("SC", "Charleston"),
    ("AL", "Birmingham"),
    ("LA", "New Orleans"),
    ("KY", "Louisville"),
    ("OR", "Portland"),
    ("OK", "Oklahoma City"),
    ("CT", "Hartford"),
    ("UT", "Salt Lake City"),
];

const WEEKDAYS: [&str; 7] = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday"];
const MCCS: [&str; 6] = ["5411", "5812", "5311", "5732", "5999", "5541"];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cia_sales_insights_cortex (
  co_id TEXT,
  td_id TEXT,
  transaction_state TEXT,
  transaction_city TEXT,
  mcc TEXT,
  channel TEXT,
  repeat_flag INTEGER,
  resp_date TEXT,
  day_of_week TEXT,
  transaction_time TEXT,
  consumer_commercial TEXT,
  repeat_transactions INTEGER,
  new_transactions INTEGER,
  repeat_spend REAL,
  new_spend REAL,
  cp_transactions INTEGER,
  cnp_transactions INTEGER,
  cp_spend REAL,
  cnp_spend REAL,
  transactions INTEGER,
  spend REAL
);
CREATE TABLE IF NOT EXISTS cia_household_insights_cortex (
  td_id TEXT,
  date_from TEXT,
  date_through TEXT,
  households_count INTEGER
);
CREATE TABLE IF NOT EXISTS sandbox_seed_metadata (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sales_state_date ON cia_sales_insights_cortex(transaction_state, resp_date);
CREATE INDEX IF NOT EXISTS idx_sales_td_id ON cia_sales_insights_cortex(td_id);
";

/// Executes guarded SQL against the embedded store. Non-read-only statements are refused.
pub struct SandboxSqlExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SandboxSqlExecutor {
    /// Opens `path`, or an in-memory database when `None`, and seeds it if empty or stale.
    pub fn open(path: Option<&Path>) -> Result<Self, InferError> {
        let mut conn = match path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(query_error)?;
        register_functions(&conn).map_err(query_error)?;
        seed(&mut conn).map_err(query_error)?;
        tracing::info!(
            store = %path.map_or_else(|| ":memory:".to_string(), |p| p.display().to_string()),
            "sandbox store ready"
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, InferError> {
        Self::open(None)
    }
}

#[async_trait]
impl SqlExecutor for SandboxSqlExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, InferError> {
        let conn = Arc::clone(&self.conn);
        let sql = sqlite_dialect(sql);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            query(&conn, &sql)
        })
        .await
        .map_err(|e| InferError::Transport(format!("sandbox worker failed: {e}")))?
    }

    fn describe(&self) -> &'static str {
        "sqlite sandbox"
    }
}

fn query_error(e: rusqlite::Error) -> InferError {
    InferError::Status {
        status: 400,
        body: e.to_string(),
    }
}

fn query(conn: &Connection, sql: &str) -> Result<Vec<Row>, InferError> {
    let mut stmt = conn.prepare(sql).map_err(query_error)?;
    if !stmt.readonly() {
        return Err(InferError::Status {
            status: 403,
            body: "sandbox accepts read-only statements only".into(),
        });
    }
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query([]).map_err(query_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_error)? {
        let mut obj = Row::new();
        for (i, name) in names.iter().enumerate() {
            let value = match row.get_ref(i).map_err(query_error)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(n) => Value::from(n),
                ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
                ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
            };
            obj.insert(name.clone(), value);
        }
        out.push(obj);
    }
    Ok(out)
}

fn dialect_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)\bDATE\s*'([^']*)'", "'$1'"),
            (r"(?i)\bILIKE\b", "LIKE"),
            (r"::\s*[A-Za-z_][A-Za-z0-9_]*", ""),
            (r"(?i)\bTRUE\b", "1"),
            (r"(?i)\bFALSE\b", "0"),
            (r"(?i)\b(DATEADD|DATE_TRUNC)\s*\(\s*([A-Za-z_]+)\s*,", "$1('$2',"),
        ]
        .into_iter()
        .filter_map(|(pattern, with)| Regex::new(pattern).ok().map(|re| (re, with)))
        .collect()
    })
}

/// Rewrites the warehouse constructs the sandbox can emulate.
pub fn sqlite_dialect(sql: &str) -> String {
    let mut out = sql.trim().trim_end_matches(';').to_string();
    for (re, with) in dialect_rules() {
        out = re.replace_all(&out, *with).into_owned();
    }
    out
}

fn as_date(value: &str) -> Option<NaiveDate> {
    let day = value.trim().split(['T', ' ']).next()?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn shift_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let n = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        date.checked_add_months(n)
    } else {
        date.checked_sub_months(n)
    }
}

fn shift_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    let n = Days::new(days.unsigned_abs());
    if days >= 0 {
        date.checked_add_days(n)
    } else {
        date.checked_sub_days(n)
    }
}

fn unit(part: &str) -> String {
    part.trim().trim_matches(['\'', '"']).to_ascii_lowercase()
}

fn date_add(part: &str, amount: i64, value: &str) -> Option<NaiveDate> {
    let base = as_date(value)?;
    match unit(part).as_str() {
        "day" | "days" | "dd" | "d" => shift_days(base, amount),
        "week" | "weeks" | "wk" => shift_days(base, amount.checked_mul(7)?),
        "month" | "months" | "mon" | "mm" => shift_months(base, amount),
        "quarter" | "quarters" | "qtr" => shift_months(base, amount.checked_mul(3)?),
        "year" | "years" | "yy" | "yyyy" => shift_months(base, amount.checked_mul(12)?),
        _ => None,
    }
}

fn date_trunc(part: &str, value: &str) -> Option<NaiveDate> {
    let base = as_date(value)?;
    match unit(part).as_str() {
        "day" | "days" => Some(base),
        "week" | "weeks" => shift_days(base, -i64::from(base.weekday().num_days_from_monday())),
        "month" | "months" | "mon" => base.with_day(1),
        "quarter" | "quarters" => NaiveDate::from_ymd_opt(base.year(), base.month0() / 3 * 3 + 1, 1),
        "year" | "years" => base.with_ordinal(1),
        _ => None,
    }
}

fn last_day(value: &str) -> Option<NaiveDate> {
    let first = as_date(value)?.with_day(1)?;
    shift_months(first, 1)?.pred_opt()
}

fn unsupported(call: String) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(format!("unsupported date expression: {call}").into())
}

fn text_arg(ctx: &Context<'_>, i: usize) -> rusqlite::Result<String> {
    ctx.get::<String>(i)
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("DATEADD", 3, flags, |ctx| {
        let (part, amount, value) = (text_arg(ctx, 0)?, ctx.get::<i64>(1)?, text_arg(ctx, 2)?);
        date_add(&part, amount, &value)
            .map(|d| d.to_string())
            .ok_or_else(|| unsupported(format!("DATEADD({part}, {amount}, {value})")))
    })?;
    conn.create_scalar_function("DATE_TRUNC", 2, flags, |ctx| {
        let (part, value) = (text_arg(ctx, 0)?, text_arg(ctx, 1)?);
        date_trunc(&part, &value)
            .map(|d| d.to_string())
            .ok_or_else(|| unsupported(format!("DATE_TRUNC({part}, {value})")))
    })?;
    conn.create_scalar_function("LAST_DAY", 1, flags, |ctx| {
        let value = text_arg(ctx, 0)?;
        last_day(&value)
            .map(|d| d.to_string())
            .ok_or_else(|| unsupported(format!("LAST_DAY({value})")))
    })?;
    Ok(())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Weekly points across the data window the sample catalog advertises.
fn seed_dates() -> Vec<NaiveDate> {
    let (Some(from), Some(through)) = (NaiveDate::from_ymd_opt(2024, 1, 1), NaiveDate::from_ymd_opt(2025, 12, 31))
    else {
        return Vec::new();
    };
    from.iter_weeks().take_while(|d| *d <= through).collect()
}

fn seed(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM sandbox_seed_metadata WHERE key = 'seed_version'",
            [],
            |r| r.get(0),
        )
        .ok();
    let sales: i64 = conn.query_row("SELECT COUNT(*) FROM cia_sales_insights_cortex", [], |r| r.get(0))?;
    if sales > 0 && current.as_deref() == Some(SEED_VERSION) {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cia_sales_insights_cortex", [])?;
    tx.execute("DELETE FROM cia_household_insights_cortex", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO cia_sales_insights_cortex VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        )?;
        for (date_index, day) in seed_dates().into_iter().enumerate() {
            let month_index = i64::from((day.year() - 2024) * 12) + i64::from(day.month0());
            let intra = i64::from(day.day0() % 7);
            let weekday = WEEKDAYS[day.weekday().num_days_from_monday() as usize];
            for (state_index, (state, city)) in STATES.iter().enumerate() {
                let si = state_index as i64;
                for channel in ["CP", "CNP"] {
                    let cnp = channel == "CNP";
                    let base = 820 + si * 23 + month_index * 15 + intra * 3 + if cnp { 70 } else { 0 };
                    let ticket = 30.5
                        + (si % 6) as f64 * 0.9
                        + month_index as f64 * 0.08
                        + intra as f64 * 0.05
                        + if cnp { 1.4 } else { 0.8 };
                    let total = round2(base as f64 * ticket);
                    let repeat_share = 0.56 + (si % 5) as f64 * 0.012 - if cnp { 0.03 } else { 0.0 };
                    let repeat_tx = (base as f64 * repeat_share) as i64;
                    let new_tx = base - repeat_tx;
                    let repeat_spend = round2(total * repeat_tx as f64 / base.max(1) as f64);
                    let new_spend = round2(total - repeat_spend);

                    for repeat_flag in [1i64, 0] {
                        let repeat = repeat_flag == 1;
                        let (row_tx, row_spend) = if repeat { (repeat_tx, repeat_spend) } else { (new_tx, new_spend) };
                        insert.execute(params![
                            format!("CO{}", state_index % 4 + 1),
                            format!("TD{:03}{:02}", state_index + 1, month_index % 8 + 1),
                            state,
                            city,
                            MCCS[(state_index + month_index as usize) % MCCS.len()],
                            channel,
                            repeat_flag,
                            day.to_string(),
                            weekday,
                            format!("{:02}:30:00", 8 + (state_index + date_index) % 10),
                            if state_index % 3 == 0 { "Commercial" } else { "Consumer" },
                            if repeat { repeat_tx } else { 0 },
                            if repeat { 0 } else { new_tx },
                            if repeat { repeat_spend } else { 0.0 },
                            if repeat { 0.0 } else { new_spend },
                            if cnp { 0 } else { row_tx },
                            if cnp { row_tx } else { 0 },
                            if cnp { 0.0 } else { row_spend },
                            if cnp { row_spend } else { 0.0 },
                            row_tx,
                            row_spend,
                        ])?;
                    }
                }
            }
        }

        let mut household = tx.prepare(
            "INSERT INTO cia_household_insights_cortex VALUES (?1, '2024-01-01', '2025-12-31', ?2)",
        )?;
        for state_index in 1..=STATES.len() as i64 {
            for suffix in 1..=8i64 {
                household.execute(params![
                    format!("TD{state_index:03}{suffix:02}"),
                    5200 + state_index * 130 + suffix * 17
                ])?;
            }
        }
    }
    tx.execute(
        "INSERT INTO sandbox_seed_metadata(key, value) VALUES('seed_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SEED_VERSION],
    )?;
    tx.commit()?;
    tracing::info!(seed_version = SEED_VERSION, "sandbox store seeded");
    Ok(())
}
