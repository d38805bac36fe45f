use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{MemberPatch, NewBooking, Reschedule, ResourcePatch};
use crate::model::*;

const DEFAULT_GRANULARITY_MINUTES: i64 = 60;
const DEFAULT_UPCOMING: usize = 5;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
        kind: ResourceKind,
        capacity: Option<u32>,
    },
    UpdateResource {
        id: Ulid,
        patch: ResourcePatch,
    },
    SelectResources,
    InsertMember {
        id: Ulid,
        name: String,
        email: String,
    },
    UpdateMember {
        id: Ulid,
        patch: MemberPatch,
    },
    SelectMembers,
    InsertBooking(NewBooking),
    BatchInsertBookings(Vec<NewBooking>),
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    RescheduleBooking {
        id: Ulid,
        change: Reschedule,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        resource_ids: Option<Vec<Ulid>>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectFirstAvailable {
        resource_ids: Option<Vec<Ulid>>,
        start: Ms,
        end: Ms,
    },
    SelectFreeBusy {
        resource_ids: Option<Vec<Ulid>>,
        start: Ms,
        end: Ms,
        granularity_minutes: i64,
    },
    SelectCalendar {
        week: Ms,
        slot_minutes: Option<i64>,
    },
    SelectUpcoming {
        count: usize,
    },
    SelectOccupancy {
        start: Ms,
        end: Ms,
    },
    SelectInUse,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table_factor_name(&table.relation)?, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by column name.
struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .filter(|e| !is_null(e))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn id(&self) -> Result<Ulid, SqlError> {
        self.get("id").map_or_else(|| Ok(Ulid::new()), parse_ulid)
    }
}

fn insert_columns(insert: &ast::Insert, defaults: &[&str]) -> Vec<String> {
    if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "resources" => {
            let columns = insert_columns(insert, &["id", "name", "kind", "capacity"]);
            let row = single_row(&table, &rows, &columns)?;
            Ok(Command::InsertResource {
                id: row.id()?,
                name: parse_string(row.require("name")?)?,
                kind: row.get("kind").map_or(Ok(ResourceKind::Desk), parse_kind)?,
                capacity: row.get("capacity").map(parse_u32).transpose()?,
            })
        }
        "members" => {
            let columns = insert_columns(insert, &["id", "name", "email"]);
            let row = single_row(&table, &rows, &columns)?;
            Ok(Command::InsertMember {
                id: row.id()?,
                name: parse_string(row.require("name")?)?,
                email: parse_string(row.require("email")?)?,
            })
        }
        "bookings" => {
            let columns = insert_columns(
                insert,
                &["id", "resource_id", "member_id", "start", "end", "status"],
            );
            let mut bookings = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = Row { columns: &columns, values };
                let booking = parse_booking_row(&row).map_err(|e| match rows.len() {
                    1 => e,
                    _ => SqlError::Parse(format!("row {i}: {e}")),
                })?;
                bookings.push(booking);
            }
            if bookings.len() == 1 {
                Ok(Command::InsertBooking(bookings.remove(0)))
            } else {
                Ok(Command::BatchInsertBookings(bookings))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'a>(
    table: &str,
    rows: &'a [Vec<Expr>],
    columns: &'a [String],
) -> Result<Row<'a>, SqlError> {
    match rows {
        [values] => Ok(Row { columns, values }),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

fn parse_booking_row(row: &Row<'_>) -> Result<NewBooking, SqlError> {
    Ok(NewBooking {
        id: row.id()?,
        resource_id: parse_ulid(row.require("resource_id")?)?,
        member_id: parse_ulid(row.require("member_id")?)?,
        start: parse_timestamp(row.require("start")?)?,
        end: parse_timestamp(row.require("end")?)?,
        status: row
            .get("status")
            .map_or(Ok(BookingStatus::Pending), parse_status)?,
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &str,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let id = extract_where_id(selection)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((column, &a.value));
    }

    match table {
        "resources" => {
            let mut patch = ResourcePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "kind" => patch.kind = Some(parse_kind(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateResource { id, patch })
        }
        "members" => {
            let mut patch = MemberPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "email" => patch.email = Some(parse_string(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateMember { id, patch })
        }
        "bookings" => {
            if let [(column, value)] = sets.as_slice()
                && column == "status"
            {
                return Ok(Command::UpdateBookingStatus {
                    id,
                    status: parse_status(value)?,
                });
            }
            let mut change = Reschedule::default();
            for (column, value) in sets {
                match column.as_str() {
                    "resource_id" => change.resource_id = Some(parse_ulid(value)?),
                    "member_id" => change.member_id = Some(parse_ulid(value)?),
                    "start" => change.start = Some(parse_timestamp(value)?),
                    "end" => change.end = Some(parse_timestamp(value)?),
                    "status" => {
                        return Err(SqlError::Unsupported(
                            "status must be updated on its own".into(),
                        ));
                    }
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::RescheduleBooking { id, change })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        "resources" | "members" => Err(SqlError::Unsupported(format!(
            "{table} are deactivated with UPDATE {table} SET active = false"
        ))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Recognised WHERE conditions, all optional at parse time.
#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    resource_ids: Option<Vec<Ulid>>,
    start: Option<Ms>,
    end: Option<Ms>,
    min_duration: Option<i64>,
    granularity: Option<i64>,
    week: Option<Ms>,
    slot_minutes: Option<i64>,
    count: Option<i64>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "members" => Ok(Command::SelectMembers),
        "bookings" => match f.id {
            Some(id) => Ok(Command::SelectBooking { id }),
            None => Ok(Command::SelectBookings {
                resource_ids: f.resource_ids,
                start: f.start,
                end: f.end,
            }),
        },
        "availability" => {
            let resource_id = match f.resource_ids.as_deref() {
                Some([id]) => *id,
                Some(_) => {
                    return Err(SqlError::Unsupported(
                        "availability takes a single resource_id".into(),
                    ));
                }
                None => return Err(SqlError::MissingFilter("resource_id")),
            };
            Ok(Command::SelectAvailability {
                resource_id,
                start: f.start.ok_or(SqlError::MissingFilter("start"))?,
                end: f.end.ok_or(SqlError::MissingFilter("end"))?,
                min_duration: f
                    .min_duration
                    .map(|m| m.checked_mul(MINUTE_MS).ok_or(SqlError::OutOfRange("min_duration")))
                    .transpose()?,
            })
        }
        "first_available" => Ok(Command::SelectFirstAvailable {
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
            resource_ids: f.resource_ids,
        }),
        "free_busy" => Ok(Command::SelectFreeBusy {
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
            resource_ids: f.resource_ids,
            granularity_minutes: f.granularity.unwrap_or(DEFAULT_GRANULARITY_MINUTES),
        }),
        "calendar" => Ok(Command::SelectCalendar {
            week: f.week.ok_or(SqlError::MissingFilter("week"))?,
            slot_minutes: f.slot_minutes,
        }),
        "upcoming" => {
            let count = match f.count {
                None => DEFAULT_UPCOMING,
                Some(n) => usize::try_from(n)
                    .map_err(|_| SqlError::Parse(format!("count must not be negative: {n}")))?,
            };
            Ok(Command::SelectUpcoming { count })
        }
        "occupancy" => Ok(Command::SelectOccupancy {
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "in_use" => Ok(Command::SelectInUse),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, f),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_filters(left, f)?;
            extract_filters(right, f)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("condition {expr}")))?;
            match (column.as_str(), op) {
                ("id", ast::BinaryOperator::Eq) => f.id = Some(parse_ulid(right)?),
                ("resource_id", ast::BinaryOperator::Eq) => {
                    f.resource_ids = Some(vec![parse_ulid(right)?]);
                }
                ("start", ast::BinaryOperator::GtEq) => f.start = Some(parse_timestamp(right)?),
                ("end", ast::BinaryOperator::LtEq) => f.end = Some(parse_timestamp(right)?),
                ("week", ast::BinaryOperator::Eq) => f.week = Some(parse_timestamp(right)?),
                ("min_duration", ast::BinaryOperator::Eq) => f.min_duration = Some(parse_i64(right)?),
                ("granularity", ast::BinaryOperator::Eq) => f.granularity = Some(parse_i64(right)?),
                ("slot_minutes", ast::BinaryOperator::Eq) => f.slot_minutes = Some(parse_i64(right)?),
                ("count", ast::BinaryOperator::Eq) => f.count = Some(parse_i64(right)?),
                _ => return Err(SqlError::Unsupported(format!("condition {expr}"))),
            }
            Ok(())
        }
        Expr::InList {
            expr: column,
            list,
            negated: false,
        } if expr_column_name(column).as_deref() == Some("resource_id") => {
            if list.len() > crate::limits::MAX_IN_CLAUSE_IDS {
                return Err(SqlError::Parse("too many ids in IN list".into()));
            }
            f.resource_ids = Some(list.iter().map(parse_ulid).collect::<Result<_, _>>()?);
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("condition {expr}"))),
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => {
            if values.rows.len() > crate::limits::MAX_BATCH_SIZE {
                return Err(SqlError::Parse("too many VALUES rows".into()));
            }
            Ok(values.rows.clone())
        }
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        Some(Expr::Nested(inner)) => extract_where_id(&Some((**inner).clone())),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        _ => Err(SqlError::Parse(format!("expected ULID, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
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
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

fn parse_kind(expr: &Expr) -> Result<ResourceKind, SqlError> {
    let s = parse_string(expr)?;
    ResourceKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown resource kind: {s}")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown booking status: {s}")))
}

/// Unix milliseconds, or an RFC 3339 / `YYYY-MM-DD` (UTC midnight) string.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        let s = s.trim();
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(ms);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.timestamp_millis());
        }
        if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(midnight.and_utc().timestamp_millis());
        }
        return Err(SqlError::Parse(format!("bad timestamp: {s}")));
    }
    parse_i64(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    OutOfRange(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing value for column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::OutOfRange(col) => write!(f, "value out of range: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const DESK: &str = "01JHZ5V3S6N8Q2W4E6R8T0Y2A4";
    const MEMBER: &str = "01JHZ5V3S6N8Q2W4E6R8T0Y2A5";
    const BOOKING: &str = "01JHZ5V3S6N8Q2W4E6R8T0Y2A6";
    // 2025-01-20T09:00Z
    const NINE: Ms = 1_737_363_600_000;

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn insert_resource_by_column_name() {
        let cmd = parse_sql(&format!(
            "INSERT INTO resources (kind, name, id, capacity) VALUES ('room', 'Salle Beta', '{DESK}', 8)"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::InsertResource {
                id: ulid(DESK),
                name: "Salle Beta".into(),
                kind: ResourceKind::Room,
                capacity: Some(8),
            }
        );
    }

    #[test]
    fn insert_resource_positional_defaults() {
        let cmd = parse_sql(&format!("INSERT INTO resources VALUES ('{DESK}', 'Desk A1')")).unwrap();
        assert!(matches!(
            cmd,
            Command::InsertResource { kind: ResourceKind::Desk, capacity: None, .. }
        ));
    }

    #[test]
    fn insert_member_generates_id_when_omitted() {
        let cmd = parse_sql("INSERT INTO members (name, email) VALUES ('Amira', 'amira@example.com')")
            .unwrap();
        match cmd {
            Command::InsertMember { name, email, .. } => {
                assert_eq!(name, "Amira");
                assert_eq!(email, "amira@example.com");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn insert_booking_with_rfc3339_times() {
        let cmd = parse_sql(&format!(
            "INSERT INTO bookings (id, resource_id, member_id, start, \"end\", status) \
             VALUES ('{BOOKING}', '{DESK}', '{MEMBER}', '2025-01-20T09:00:00Z', '2025-01-20T12:00:00+00:00', 'confirmed')"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::InsertBooking(NewBooking {
                id: ulid(BOOKING),
                resource_id: ulid(DESK),
                member_id: ulid(MEMBER),
                start: NINE,
                end: NINE + 3 * HOUR_MS,
                status: BookingStatus::Confirmed,
            })
        );
    }

    #[test]
    fn insert_booking_defaults_to_pending() {
        let cmd = parse_sql(&format!(
            "INSERT INTO bookings (resource_id, member_id, start, \"end\") VALUES ('{DESK}', '{MEMBER}', {NINE}, {})",
            NINE + HOUR_MS
        ))
        .unwrap();
        assert!(matches!(
            cmd,
            Command::InsertBooking(NewBooking { status: BookingStatus::Pending, .. })
        ));
    }

    #[test]
    fn multi_row_booking_insert_is_a_batch() {
        let cmd = parse_sql(&format!(
            "INSERT INTO bookings (resource_id, member_id, start, \"end\") VALUES \
             ('{DESK}', '{MEMBER}', {NINE}, {}), ('{DESK}', '{MEMBER}', {}, {})",
            NINE + HOUR_MS,
            NINE + 24 * HOUR_MS,
            NINE + 25 * HOUR_MS
        ))
        .unwrap();
        match cmd {
            Command::BatchInsertBookings(rows) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn batch_row_errors_name_the_row() {
        let err = parse_sql(&format!(
            "INSERT INTO bookings (resource_id, member_id, start, \"end\") VALUES \
             ('{DESK}', '{MEMBER}', {NINE}, {}), ('{DESK}', 'nope', 1, 2)",
            NINE + HOUR_MS
        ))
        .unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn missing_required_column() {
        let err = parse_sql(&format!(
            "INSERT INTO bookings (resource_id, start, \"end\") VALUES ('{DESK}', 1, 2)"
        ))
        .unwrap_err();
        assert!(matches!(err, SqlError::MissingColumn("member_id")));
    }

    #[test]
    fn update_status() {
        let cmd = parse_sql(&format!(
            "UPDATE bookings SET status = 'checked_in' WHERE id = '{BOOKING}'"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::UpdateBookingStatus {
                id: ulid(BOOKING),
                status: BookingStatus::CheckedIn,
            }
        );
    }

    #[test]
    fn update_times_is_a_reschedule() {
        let cmd = parse_sql(&format!(
            "UPDATE bookings SET start = {NINE}, \"end\" = {}, resource_id = '{DESK}' WHERE id = '{BOOKING}'",
            NINE + HOUR_MS
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::RescheduleBooking {
                id: ulid(BOOKING),
                change: Reschedule {
                    resource_id: Some(ulid(DESK)),
                    member_id: None,
                    start: Some(NINE),
                    end: Some(NINE + HOUR_MS),
                },
            }
        );
    }

    #[test]
    fn status_cannot_be_mixed_with_reschedule() {
        let err = parse_sql(&format!(
            "UPDATE bookings SET status = 'confirmed', start = 1 WHERE id = '{BOOKING}'"
        ))
        .unwrap_err();
        assert!(matches!(err, SqlError::Unsupported(_)));
    }

    #[test]
    fn archive_resource() {
        let cmd = parse_sql(&format!("UPDATE resources SET active = false WHERE id = '{DESK}'"))
            .unwrap();
        assert_eq!(
            cmd,
            Command::UpdateResource {
                id: ulid(DESK),
                patch: ResourcePatch { active: Some(false), ..Default::default() },
            }
        );
    }

    #[test]
    fn delete_only_for_bookings() {
        assert_eq!(
            parse_sql(&format!("DELETE FROM bookings WHERE id = '{BOOKING}'")).unwrap(),
            Command::DeleteBooking { id: ulid(BOOKING) }
        );
        assert!(matches!(
            parse_sql(&format!("DELETE FROM members WHERE id = '{MEMBER}'")),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn select_bookings_with_in_list_and_window() {
        let cmd = parse_sql(&format!(
            "SELECT * FROM bookings WHERE resource_id IN ('{DESK}', '{MEMBER}') AND start >= '2025-01-20' AND \"end\" <= {}",
            NINE + HOUR_MS
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookings {
                resource_ids: Some(vec![ulid(DESK), ulid(MEMBER)]),
                start: Some(NINE - 9 * HOUR_MS),
                end: Some(NINE + HOUR_MS),
            }
        );
    }

    #[test]
    fn select_single_booking_by_id() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM bookings WHERE id = '{BOOKING}'")).unwrap(),
            Command::SelectBooking { id: ulid(BOOKING) }
        );
    }

    #[test]
    fn select_availability_requires_window() {
        assert!(matches!(
            parse_sql(&format!("SELECT * FROM availability WHERE resource_id = '{DESK}'")),
            Err(SqlError::MissingFilter("start"))
        ));
        let cmd = parse_sql(&format!(
            "SELECT * FROM availability WHERE resource_id = '{DESK}' AND start >= 0 AND \"end\" <= 10 AND min_duration = 30"
        ))
        .unwrap();
        assert!(matches!(
            cmd,
            Command::SelectAvailability { min_duration: Some(d), .. } if d == 30 * MINUTE_MS
        ));
    }

    #[test]
    fn huge_min_duration_is_out_of_range() {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_id = '{DESK}' AND start >= 0 AND \"end\" <= 10 AND min_duration = {}",
            1i64 << 59
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::OutOfRange("min_duration"))));
    }

    #[test]
    fn virtual_tables() {
        assert!(matches!(
            parse_sql("SELECT * FROM free_busy WHERE start >= 0 AND \"end\" <= 10").unwrap(),
            Command::SelectFreeBusy { granularity_minutes: 60, resource_ids: None, .. }
        ));
        assert_eq!(
            parse_sql("SELECT * FROM calendar WHERE week = '2025-01-22' AND slot_minutes = 30").unwrap(),
            Command::SelectCalendar {
                week: NINE - 9 * HOUR_MS + 2 * 24 * HOUR_MS,
                slot_minutes: Some(30),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM upcoming").unwrap(),
            Command::SelectUpcoming { count: 5 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM upcoming WHERE count = 3").unwrap(),
            Command::SelectUpcoming { count: 3 }
        );
        assert_eq!(parse_sql("SELECT * FROM in_use").unwrap(), Command::SelectInUse);
    }

    #[test]
    fn unknown_filters_and_tables() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE colour = 'red'"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM invoices"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
