use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::PeriodPatch;
use crate::limits::MAX_IN_CLAUSE_IDS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPeriod {
        id: Option<Ulid>,
        accommodation_id: Ulid,
        owner_id: Ulid,
        span: Span,
        price: PriceConfig,
    },
    UpdatePeriod {
        id: Ulid,
        owner_id: Ulid,
        patch: PeriodPatch,
    },
    DeletePeriod {
        id: Ulid,
        owner_id: Ulid,
    },
    DeleteAccommodationPeriods {
        accommodation_ids: Vec<Ulid>,
    },
    InsertReservation {
        id: Option<Ulid>,
        period_id: Ulid,
        user_id: Ulid,
        span: Span,
        guest_count: u32,
    },
    DeleteReservation {
        id: Ulid,
        period_id: Ulid,
        user_id: Ulid,
    },
    DeleteUserReservations {
        user_id: Ulid,
    },
    SelectPeriods {
        accommodation_id: Ulid,
        id: Option<Ulid>,
    },
    SelectPeriodById {
        id: Ulid,
    },
    SelectReservationsByPeriod {
        period_id: Ulid,
    },
    SelectReservationsByUser {
        user_id: Ulid,
        expired_only: bool,
    },
    SelectAvailableAccommodations {
        accommodation_ids: Vec<Ulid>,
        window: Span,
    },
}

pub const PERIOD_COLUMNS: [&str; 8] = [
    "id",
    "accommodation_id",
    "owner_id",
    "start",
    "end",
    "per_guest",
    "rate_per_guest",
    "rate_flat",
];

pub const RESERVATION_COLUMNS: [&str; 6] = ["id", "period_id", "user_id", "start", "end", "guest_count"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let known: &[&'static str] = match table.as_str() {
        "periods" => &PERIOD_COLUMNS,
        "reservations" => &RESERVATION_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, known)?;

    match table.as_str() {
        "periods" => Ok(Command::InsertPeriod {
            id: optional(&row, "id", parse_id_expr)?,
            accommodation_id: parse_id_expr(required(&row, "accommodation_id")?)?,
            owner_id: parse_id_expr(required(&row, "owner_id")?)?,
            span: Span::new(
                parse_timestamp_expr(required(&row, "start")?)?,
                parse_timestamp_expr(required(&row, "end")?)?,
            ),
            price: PriceConfig {
                per_guest: optional(&row, "per_guest", parse_bool)?.unwrap_or(false),
                rate_per_guest: optional(&row, "rate_per_guest", parse_i64_expr)?.unwrap_or(0),
                rate_flat: optional(&row, "rate_flat", parse_i64_expr)?.unwrap_or(0),
            },
        }),
        _ => Ok(Command::InsertReservation {
            id: optional(&row, "id", parse_id_expr)?,
            period_id: parse_id_expr(required(&row, "period_id")?)?,
            user_id: parse_id_expr(required(&row, "user_id")?)?,
            span: Span::new(
                parse_timestamp_expr(required(&row, "start")?)?,
                parse_timestamp_expr(required(&row, "end")?)?,
            ),
            guest_count: parse_u32(required(&row, "guest_count")?)?,
        }),
    }
}

/// Column → value for a single-row INSERT. Without a column list the values
/// are matched positionally against `known`.
fn insert_row<'a>(
    insert: &'a ast::Insert,
    known: &[&'static str],
) -> Result<HashMap<&'static str, &'a Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let mut out = HashMap::new();
    if insert.columns.is_empty() {
        if row.len() > known.len() {
            return Err(SqlError::WrongArity(known.len(), row.len()));
        }
        for (col, expr) in known.iter().zip(row) {
            out.insert(*col, expr);
        }
        return Ok(out);
    }

    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
    }
    for (ident, expr) in insert.columns.iter().zip(row) {
        let name = ident.value.to_lowercase();
        let col = known
            .iter()
            .find(|k| **k == name)
            .ok_or(SqlError::UnknownColumn(name))?;
        out.insert(*col, expr);
    }
    Ok(out)
}

fn required<'a>(row: &HashMap<&'static str, &'a Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(col).copied().ok_or(SqlError::MissingColumn(col))
}

/// Absent column or NULL → `None`.
fn optional<T>(
    row: &HashMap<&'static str, &Expr>,
    col: &'static str,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match row.get(col) {
        None => Ok(None),
        Some(expr) if is_null(expr) => Ok(None),
        Some(expr) => parse(expr).map(Some),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "periods" {
        return Err(SqlError::Unsupported(format!("UPDATE {table}")));
    }

    let mut patch = PeriodPatch::default();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            _ => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        let value = &assignment.value;
        match col.as_str() {
            "start" => patch.start = Some(parse_timestamp_expr(value)?),
            "end" => patch.end = Some(parse_timestamp_expr(value)?),
            "per_guest" => patch.per_guest = Some(parse_bool(value)?),
            "rate_per_guest" => patch.rate_per_guest = Some(parse_i64_expr(value)?),
            "rate_flat" => patch.rate_flat = Some(parse_i64_expr(value)?),
            _ => return Err(SqlError::Unsupported(format!("cannot update column {col}"))),
        }
    }

    let filters = Filters::from_selection(selection)?;
    Ok(Command::UpdatePeriod {
        id: filters.id("id")?,
        owner_id: filters.id("owner_id")?,
        patch,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(&delete.selection)?;

    match table.as_str() {
        "periods" => {
            if filters.has("accommodation_id") {
                Ok(Command::DeleteAccommodationPeriods {
                    accommodation_ids: filters.ids("accommodation_id")?,
                })
            } else {
                Ok(Command::DeletePeriod {
                    id: filters.id("id")?,
                    owner_id: filters.id("owner_id")?,
                })
            }
        }
        "reservations" => {
            if filters.has("id") {
                Ok(Command::DeleteReservation {
                    id: filters.id("id")?,
                    period_id: filters.id("period_id")?,
                    user_id: filters.id("user_id")?,
                })
            } else {
                Ok(Command::DeleteUserReservations {
                    user_id: filters.id("user_id")?,
                })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "periods" => {
            if filters.has("accommodation_id") {
                Ok(Command::SelectPeriods {
                    accommodation_id: filters.id("accommodation_id")?,
                    id: filters.optional_id("id")?,
                })
            } else {
                Ok(Command::SelectPeriodById { id: filters.id("id")? })
            }
        }
        "reservations" => {
            if filters.has("period_id") {
                Ok(Command::SelectReservationsByPeriod {
                    period_id: filters.id("period_id")?,
                })
            } else {
                Ok(Command::SelectReservationsByUser {
                    user_id: filters.id("user_id")?,
                    expired_only: match filters.eq.get("expired") {
                        Some(expr) => parse_bool(expr)?,
                        None => false,
                    },
                })
            }
        }
        "available_accommodations" => Ok(Command::SelectAvailableAccommodations {
            accommodation_ids: filters.ids("accommodation_id")?,
            window: Span::new(
                parse_timestamp_expr(filters.gte.get("start").ok_or(SqlError::MissingFilter("start"))?)?,
                parse_timestamp_expr(filters.lte.get("end").ok_or(SqlError::MissingFilter("end"))?)?,
            ),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

/// Conjunction of simple column predicates.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    in_list: HashMap<String, Vec<Expr>>,
    gte: HashMap<String, Expr>,
    lte: HashMap<String, Expr>,
}

impl Filters {
    fn from_selection(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let slot = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.gte,
                    ast::BinaryOperator::LtEq => &mut self.lte,
                    other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                slot.insert(col, (**right).clone());
                Ok(())
            }
            Expr::InList {
                expr: col,
                list,
                negated: false,
            } => {
                let col = expr_column_name(col)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                self.in_list.insert(col, list.clone());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("predicate {other}"))),
        }
    }

    fn has(&self, col: &str) -> bool {
        self.eq.contains_key(col) || self.in_list.contains_key(col)
    }

    fn id(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.optional_id(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn optional_id(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(col).map(parse_id_expr).transpose()
    }

    /// `col = x` or `col IN (...)`, deduplicated in order of appearance.
    fn ids(&self, col: &'static str) -> Result<Vec<Ulid>, SqlError> {
        let exprs: Vec<&Expr> = match (self.eq.get(col), self.in_list.get(col)) {
            (Some(expr), _) => vec![expr],
            (None, Some(list)) => list.iter().collect(),
            (None, None) => return Err(SqlError::MissingFilter(col)),
        };
        if exprs.len() > MAX_IN_CLAUSE_IDS {
            return Err(SqlError::TooManyIds(exprs.len()));
        }
        let mut ids = Vec::with_capacity(exprs.len());
        for expr in exprs {
            let id = parse_id_expr(expr)?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_id_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            parse_id(s).map_err(SqlError::InvalidId)
        }
        Some(value) => Err(SqlError::Parse(format!("expected id, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer overflow".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds as a number, or a quoted date / timestamp string.
/// Zone-less strings are taken as UTC; a bare date means midnight.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            parse_timestamp(s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
        }
        _ => parse_i64_expr(expr),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    TooManyIds(usize),
    InvalidId(IdError),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::InvalidId(_) => "22P02",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::TooManyIds(_) => "54000",
            SqlError::Unsupported(_) => "0A000",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => write!(f, "expected {expected} values, got {got}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::TooManyIds(n) => write!(f, "{n} ids in IN list, limit is {MAX_IN_CLAUSE_IDS}"),
            SqlError::InvalidId(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}
