use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::lifecycle::BookingStatus;
use crate::model::*;
use crate::service::RoomDraft;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    Register {
        id: Ulid,
        email: String,
        password: String,
    },
    Login {
        email: String,
        password: String,
    },
    SetSessionAuthorization {
        token: String,
    },
    ResetSessionAuthorization,
    SetUserRole {
        id: Ulid,
        role: Role,
    },
    InsertRoom {
        id: Ulid,
        draft: RoomDraft,
    },
    UpdateRoom {
        id: Ulid,
        draft: RoomDraft,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    InsertBooking {
        id: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectRoomBookings {
        room_id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectMyBookings,
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        id: Ulid,
    },
}

const SET_SESSION_AUTH: &str = "SET SESSION AUTHORIZATION";
const RESET_SESSION_AUTH: &str = "RESET SESSION AUTHORIZATION";

const USER_COLUMNS: &[&str] = &["id", "email", "password"];
const ROOM_COLUMNS: &[&str] = &["id", "name", "description", "capacity", "photo_url", "is_active"];
const BOOKING_COLUMNS: &[&str] = &["id", "room_id", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_session_authorization(trimmed)? {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
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

/// `SET SESSION AUTHORIZATION '<token>'` binds a credential to the session;
/// `RESET SESSION AUTHORIZATION` (or `... DEFAULT`) clears it.
fn parse_session_authorization(sql: &str) -> Result<Option<Command>, SqlError> {
    if sql.eq_ignore_ascii_case(RESET_SESSION_AUTH) {
        return Ok(Some(Command::ResetSessionAuthorization));
    }
    // Compare bytes, not case-folded text: folding can change byte lengths.
    let Some(arg) = sql
        .get(..SET_SESSION_AUTH.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(SET_SESSION_AUTH))
        .and_then(|_| sql.get(SET_SESSION_AUTH.len()..))
    else {
        return Ok(None);
    };
    let arg = arg.trim();
    if arg.eq_ignore_ascii_case("DEFAULT") {
        return Ok(Some(Command::ResetSessionAuthorization));
    }
    let token = arg
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .ok_or_else(|| SqlError::Parse("session authorization must be a quoted string".into()))?;
    if token.is_empty() {
        return Err(SqlError::Parse("empty session authorization".into()));
    }
    Ok(Some(Command::SetSessionAuthorization {
        token: token.to_string(),
    }))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "users" => {
            let row = insert_row(insert, "users", USER_COLUMNS)?;
            Ok(Command::Register {
                id: parse_ulid(row.required("id")?)?,
                email: parse_string("email", row.required("email")?)?,
                password: parse_string("password", row.required("password")?)?,
            })
        }
        "rooms" => {
            let row = insert_row(insert, "rooms", ROOM_COLUMNS)?;
            Ok(Command::InsertRoom {
                id: parse_ulid(row.required("id")?)?,
                draft: room_draft(&row)?,
            })
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(row.required("id")?)?,
                room_id: parse_ulid(row.required("room_id")?)?,
                start: parse_instant("start", row.required("start")?)?,
                end: parse_instant("end", row.required("end")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Fields::new("UPDATE");
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.insert(column, assignment.value.clone());
    }
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "users" => {
            set.only(&["role"])?;
            let role = parse_string("role", set.required("role")?)?;
            let role = role.parse::<Role>().map_err(|reason| SqlError::InvalidValue {
                column: "role",
                reason,
            })?;
            Ok(Command::SetUserRole { id, role })
        }
        "rooms" => {
            set.only(&ROOM_COLUMNS[1..])?;
            Ok(Command::UpdateRoom {
                id,
                draft: room_draft(&set)?,
            })
        }
        "bookings" => {
            set.only(&["status"])?;
            let status = parse_string("status", set.required("status")?)?;
            let status = status
                .parse::<BookingStatus>()
                .map_err(|e| invalid("status", e.to_string()))?;
            Ok(Command::UpdateBookingStatus { id, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Fields::new("WHERE");
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => {
            filters.only(&["id"])?;
            let id = filters.get("id").map(parse_ulid).transpose()?;
            Ok(Command::SelectRooms { id })
        }
        "bookings" => {
            filters.only(&["id", "room_id"])?;
            match (filters.get("id"), filters.get("room_id")) {
                (Some(id), None) => Ok(Command::SelectBooking { id: parse_ulid(id)? }),
                (None, Some(room_id)) => Ok(Command::SelectRoomBookings {
                    room_id: parse_ulid(room_id)?,
                }),
                (None, None) => Err(SqlError::MissingFilter("room_id")),
                (Some(_), Some(_)) => Err(SqlError::Unsupported(
                    "filter bookings by id or room_id, not both".into(),
                )),
            }
        }
        "my_bookings" => {
            filters.only(&[])?;
            Ok(Command::SelectMyBookings)
        }
        "tokens" => {
            filters.only(&["email", "password"])?;
            let email = filters.get("email").ok_or(SqlError::MissingFilter("email"))?;
            let password = filters
                .get("password")
                .ok_or(SqlError::MissingFilter("password"))?;
            Ok(Command::Login {
                email: parse_string("email", email)?,
                password: parse_string("password", password)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2 ...` into column → value.
fn collect_eq_filters(expr: &Expr, filters: &mut Fields) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, filters)?;
                collect_eq_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                filters.insert(col, (**right).clone());
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
        },
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

fn room_draft(fields: &Fields) -> Result<RoomDraft, SqlError> {
    Ok(RoomDraft {
        name: parse_string("name", fields.required("name")?)?,
        description: fields
            .get("description")
            .map(|e| parse_string_or_null("description", e))
            .transpose()?
            .flatten(),
        capacity: parse_i64("capacity", fields.required("capacity")?)?,
        photo_url: fields
            .get("photo_url")
            .map(|e| parse_string_or_null("photo_url", e))
            .transpose()?
            .flatten(),
        is_active: fields
            .get("is_active")
            .map(|e| parse_bool("is_active", e))
            .transpose()?
            .unwrap_or(true),
    })
}

// ── Helpers ───────────────────────────────────────────────────

/// Column → expression pairs from an INSERT row, SET list or WHERE clause.
struct Fields {
    clause: &'static str,
    values: HashMap<String, Expr>,
}

impl Fields {
    fn new(clause: &'static str) -> Self {
        Self {
            clause,
            values: HashMap::new(),
        }
    }

    fn insert(&mut self, column: String, value: Expr) {
        self.values.insert(column, value);
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.values.get(column)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Reject any column outside `allowed`.
    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.values.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(col) => Err(SqlError::Unsupported(format!("column {col} in {}", self.clause))),
            None => Ok(()),
        }
    }
}

/// A single VALUES row keyed by column. Without a column list, values map
/// positionally onto a prefix of `defaults`.
fn insert_row(insert: &ast::Insert, table: &'static str, defaults: &[&str]) -> Result<Fields, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > defaults.len() {
            return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
        }
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        if values.len() != insert.columns.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let mut row = Fields::new("INSERT");
    for (column, value) in columns.into_iter().zip(values) {
        row.insert(column, value);
    }
    row.only(defaults)?;
    Ok(row)
}

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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn invalid(column: &'static str, reason: impl Into<String>) -> SqlError {
    SqlError::InvalidValue {
        column,
        reason: reason.into(),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| invalid("id", format!("bad ULID: {e}")))
        }
        Some(value) => Err(invalid("id", format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(column: &'static str, expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(column, expr)?.ok_or_else(|| invalid(column, "must not be NULL"))
}

fn parse_string_or_null(column: &'static str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(invalid(column, format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(column: &'static str, expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(column, expr)?
            .checked_neg()
            .ok_or_else(|| invalid(column, "integer out of range"));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| invalid(column, format!("bad integer: {e}"))),
        Some(value) => Err(invalid(column, format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// An instant: integer Unix milliseconds, or an RFC 3339 string with offset.
fn parse_instant(column: &'static str, expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return chrono::DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| invalid(column, format!("bad RFC 3339 timestamp: {e}")));
    }
    parse_i64(column, expr)
}

fn parse_bool(column: &'static str, expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(invalid(column, format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(invalid(column, format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    /// Well-formed SQL carrying a value the column cannot hold.
    #[error("invalid value for {column}: {reason}")]
    InvalidValue { column: &'static str, reason: String },
}
