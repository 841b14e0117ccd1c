use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Option<Ulid>,
        draft: RoomDraft,
    },
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    InsertOperatingHour {
        id: Option<Ulid>,
        draft: OperatingHourDraft,
    },
    UpdateOperatingHour {
        id: Ulid,
        patch: OperatingHourPatch,
    },
    DeleteOperatingHour {
        id: Ulid,
    },
    SelectOperatingHours {
        room_id: Option<Ulid>,
    },
    InsertException {
        id: Option<Ulid>,
        draft: ExceptionDraft,
    },
    UpdateException {
        id: Ulid,
        patch: ExceptionPatch,
    },
    DeleteException {
        id: Ulid,
    },
    SelectExceptions {
        room_id: Option<Ulid>,
    },
    InsertReservation {
        draft: ReservationDraft,
    },
    UpdateReservation {
        code: String,
        patch: ReservationPatch,
    },
    DeleteReservation {
        code: String,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectEffectiveHours {
        room_id: Ulid,
        date: NaiveDate,
    },
}

const ROOM_COLUMNS: &[&str] = &["id", "name", "capacity", "department"];
const HOUR_COLUMNS: &[&str] = &["id", "room_id", "weekday", "opening", "closing", "max_duration"];
const EXCEPTION_COLUMNS: &[&str] = &["id", "room_id", "date", "reason", "opening", "closing"];
const RESERVATION_COLUMNS: &[&str] = &[
    "room_id", "group_id", "link_id", "start", "end", "purpose", "priority",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let names: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "rooms" => {
            let row = Row::bind(&table, ROOM_COLUMNS, &names, values)?;
            Ok(Command::InsertRoom {
                id: row.optional("id", parse_ulid)?,
                draft: RoomDraft {
                    name: row.required("name", parse_string)?,
                    capacity: row.optional("capacity", parse_u32)?.unwrap_or(0),
                    department: row.optional("department", parse_string)?,
                },
            })
        }
        "operating_hours" => {
            let row = Row::bind(&table, HOUR_COLUMNS, &names, values)?;
            Ok(Command::InsertOperatingHour {
                id: row.optional("id", parse_ulid)?,
                draft: OperatingHourDraft {
                    room_id: row.required("room_id", parse_ulid)?,
                    weekday: row.required("weekday", parse_u8)?,
                    opening: row.required("opening", parse_time)?,
                    closing: row.required("closing", parse_time)?,
                    max_duration_minutes: row.optional("max_duration", parse_u32)?,
                },
            })
        }
        "exceptions" => {
            let row = Row::bind(&table, EXCEPTION_COLUMNS, &names, values)?;
            Ok(Command::InsertException {
                id: row.optional("id", parse_ulid)?,
                draft: ExceptionDraft {
                    room_id: row.required("room_id", parse_ulid)?,
                    date: row.required("date", parse_date)?,
                    reason: row.optional("reason", parse_string)?,
                    opening: row.optional("opening", parse_time)?,
                    closing: row.optional("closing", parse_time)?,
                },
            })
        }
        "reservations" => {
            let row = Row::bind(&table, RESERVATION_COLUMNS, &names, values)?;
            Ok(Command::InsertReservation {
                draft: ReservationDraft {
                    room_id: row.required("room_id", parse_ulid)?,
                    group_id: row.required("group_id", parse_i64)?,
                    link_id: row.optional("link_id", parse_i64)?,
                    start: row.required("start", parse_timestamp)?,
                    end: row.required("end", parse_timestamp)?,
                    purpose: row.required("purpose", parse_string)?,
                    priority: row.optional("priority", parse_i32)?.unwrap_or(0),
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;

    let mut pairs = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        pairs.push((column, assignment.value.clone()));
    }

    match table.as_str() {
        "rooms" => {
            let row = Row::named(&table, &ROOM_COLUMNS[1..], pairs)?;
            Ok(Command::UpdateRoom {
                id: where_eq(selection, "id", parse_ulid)?,
                patch: RoomPatch {
                    name: row.optional("name", parse_string)?,
                    capacity: row.optional("capacity", parse_u32)?,
                    department: row.nullable("department", parse_string)?,
                },
            })
        }
        "operating_hours" => {
            let row = Row::named(&table, &HOUR_COLUMNS[2..], pairs)?;
            Ok(Command::UpdateOperatingHour {
                id: where_eq(selection, "id", parse_ulid)?,
                patch: OperatingHourPatch {
                    weekday: row.optional("weekday", parse_u8)?,
                    opening: row.optional("opening", parse_time)?,
                    closing: row.optional("closing", parse_time)?,
                    max_duration_minutes: row.nullable("max_duration", parse_u32)?,
                },
            })
        }
        "exceptions" => {
            let row = Row::named(&table, &EXCEPTION_COLUMNS[2..], pairs)?;
            Ok(Command::UpdateException {
                id: where_eq(selection, "id", parse_ulid)?,
                patch: ExceptionPatch {
                    date: row.optional("date", parse_date)?,
                    reason: row.nullable("reason", parse_string)?,
                    opening: row.nullable("opening", parse_time)?,
                    closing: row.nullable("closing", parse_time)?,
                },
            })
        }
        "reservations" => {
            let row = Row::named(&table, RESERVATION_COLUMNS, pairs)?;
            Ok(Command::UpdateReservation {
                code: where_eq(selection, "code", parse_string)?,
                patch: ReservationPatch {
                    room_id: row.optional("room_id", parse_ulid)?,
                    group_id: row.optional("group_id", parse_i64)?,
                    link_id: row.nullable("link_id", parse_i64)?,
                    start: row.optional("start", parse_timestamp)?,
                    end: row.optional("end", parse_timestamp)?,
                    purpose: row.optional("purpose", parse_string)?,
                    priority: row.optional("priority", parse_i32)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let selection = &delete.selection;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom {
            id: where_eq(selection, "id", parse_ulid)?,
        }),
        "operating_hours" => Ok(Command::DeleteOperatingHour {
            id: where_eq(selection, "id", parse_ulid)?,
        }),
        "exceptions" => Ok(Command::DeleteException {
            id: where_eq(selection, "id", parse_ulid)?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            code: where_eq(selection, "code", parse_string)?,
        }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms {
            id: filter_eq(&filters, "id", parse_ulid)?,
        }),
        "operating_hours" => Ok(Command::SelectOperatingHours {
            room_id: filter_eq(&filters, "room_id", parse_ulid)?,
        }),
        "exceptions" => Ok(Command::SelectExceptions {
            room_id: filter_eq(&filters, "room_id", parse_ulid)?,
        }),
        "reservations" => {
            let include_cancelled = filter_eq(&filters, "include_cancelled", parse_bool)?;
            let mut filter = ReservationFilter {
                code: filter_eq(&filters, "code", parse_string)?,
                room_id: filter_eq(&filters, "room_id", parse_ulid)?,
                group_id: filter_eq(&filters, "group_id", parse_i64)?,
                start_after: None,
                end_before: None,
                visibility: if include_cancelled == Some(true) {
                    Visibility::IncludeCancelled
                } else {
                    Visibility::ActiveOnly
                },
            };
            for f in &filters {
                match (f.column.as_str(), f.op) {
                    ("start", FilterOp::GtEq) => filter.start_after = Some(parse_timestamp(&f.value)?),
                    ("end", FilterOp::LtEq) => filter.end_before = Some(parse_timestamp(&f.value)?),
                    _ => {}
                }
            }
            Ok(Command::SelectReservations { filter })
        }
        "effective_hours" => Ok(Command::SelectEffectiveHours {
            room_id: filter_eq(&filters, "room_id", parse_ulid)?
                .ok_or(SqlError::MissingFilter("room_id"))?,
            date: filter_eq(&filters, "date", parse_date)?.ok_or(SqlError::MissingFilter("date"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    GtEq,
    LtEq,
}

#[derive(Debug)]
struct Filter {
    column: String,
    op: FilterOp,
    value: Expr,
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_filters(expr: &Expr, out: &mut Vec<Filter>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Filter {
                column,
                op,
                value: right.as_ref().clone(),
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter_eq<T>(
    filters: &[Filter],
    column: &str,
    parse: fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    filters
        .iter()
        .find(|f| f.op == FilterOp::Eq && f.column == column)
        .map(|f| parse(&f.value))
        .transpose()
}

/// `WHERE <column> = <value>`, the only shape UPDATE and DELETE accept.
fn where_eq<T>(
    selection: &Option<Expr>,
    column: &'static str,
    parse: fn(&Expr) -> Result<T, SqlError>,
) -> Result<T, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => parse(right),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

// ── Column binding ────────────────────────────────────────────

/// Column values of one INSERT row or one UPDATE SET list.
struct Row {
    values: Vec<(String, Expr)>,
}

impl Row {
    /// Pair VALUES with the column list, or with `columns` in order when the
    /// statement names none.
    fn bind(
        table: &str,
        columns: &[&str],
        names: &[String],
        values: Vec<Expr>,
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if names.is_empty() {
            if values.len() > columns.len() {
                return Err(SqlError::WrongArity(table.to_string(), columns.len(), values.len()));
            }
            columns.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            if names.len() != values.len() {
                return Err(SqlError::WrongArity(table.to_string(), names.len(), values.len()));
            }
            names.to_vec()
        };
        Self::named(table, columns, names.into_iter().zip(values).collect())
    }

    fn named(table: &str, columns: &[&str], values: Vec<(String, Expr)>) -> Result<Self, SqlError> {
        for (name, _) in &values {
            if !columns.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table.to_string(), name.clone()));
            }
        }
        Ok(Self { values })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required<T>(
        &self,
        column: &'static str,
        parse: fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        match self.get(column) {
            Some(e) if !is_null(e) => parse(e),
            _ => Err(SqlError::MissingColumn(column)),
        }
    }

    /// Absent and NULL both read as `None`.
    fn optional<T>(
        &self,
        column: &str,
        parse: fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(column) {
            Some(e) if !is_null(e) => parse(e).map(Some),
            _ => Ok(None),
        }
    }

    /// Absent is `None`, NULL is `Some(None)`.
    fn nullable<T>(
        &self,
        column: &str,
        parse: fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<Option<T>>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(Some(None)),
            Some(e) => parse(e).map(|v| Some(Some(v))),
        }
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The single VALUES row of an INSERT.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal behind an expression, looking through casts and parentheses.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn text_of(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    text_of(expr).map(str::to_string)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    Ulid::from_string(text_of(expr)?).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = text_of(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
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
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// RFC 3339 instant. A space may stand in for the `T`.
fn parse_timestamp(expr: &Expr) -> Result<DateTime<FixedOffset>, SqlError> {
    let s = text_of(expr)?.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z"))
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%#z"))
        .map_err(|_| SqlError::Parse(format!("bad timestamp {s:?}, expected RFC 3339 with offset")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = text_of(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = text_of(expr)?.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long")]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(String, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(String, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
