use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;

/// Which rows a `SELECT ... FROM reservations` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Id(Ulid),
    Vendor(Ulid),
}

/// Parsed command from SQL input.
///
/// INSERT values are positional, in the column order shown on each variant.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `resource_days (label, capacity)`
    InsertResourceDay { label: String, capacity: i64 },
    UpdateResourceDay { label: String, capacity: i64 },
    SelectResourceDays { label: Option<String> },
    /// `reservations (vendor_id, resource_day, date)`
    InsertReservation {
        vendor_id: Ulid,
        resource_day: String,
        date: NaiveDate,
    },
    UpdateReservation {
        id: Ulid,
        resource_day: Option<String>,
        date: Option<NaiveDate>,
    },
    DeleteReservation { id: Ulid },
    SelectReservations { filter: ReservationFilter },
    SelectUpcoming,
    SelectAvailability { resource_day: String, date: NaiveDate },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
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
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resource_days" => {
            let [label, capacity] = values.as_slice() else {
                return Err(SqlError::WrongArity("resource_days", 2, values.len()));
            };
            Ok(Command::InsertResourceDay {
                label: parse_string_expr(label)?,
                capacity: parse_i64_expr(capacity)?,
            })
        }
        "reservations" => {
            let [vendor_id, resource_day, date] = values.as_slice() else {
                return Err(SqlError::WrongArity("reservations", 3, values.len()));
            };
            Ok(Command::InsertReservation {
                vendor_id: parse_ulid_expr(vendor_id)?,
                resource_day: parse_string_expr(resource_day)?,
                date: parse_date_expr(date)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((column, &a.value));
    }
    let filters = where_equalities(selection)?;

    match table.as_str() {
        "resource_days" => {
            let mut capacity = None;
            for (column, value) in set {
                match column.as_str() {
                    "capacity" => capacity = Some(parse_i64_expr(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn(column)),
                }
            }
            Ok(Command::UpdateResourceDay {
                label: parse_string_expr(require_filter(&filters, "label")?)?,
                capacity: capacity.ok_or(SqlError::MissingAssignment("capacity"))?,
            })
        }
        "reservations" => {
            let (mut resource_day, mut date) = (None, None);
            for (column, value) in set {
                match column.as_str() {
                    "resource_day" => resource_day = Some(parse_string_expr(value)?),
                    "date" => date = Some(parse_date_expr(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn(column)),
                }
            }
            Ok(Command::UpdateReservation {
                id: parse_ulid_expr(require_filter(&filters, "id")?)?,
                resource_day,
                date,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_equalities(delete.selection.as_ref())?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid_expr(require_filter(&filters, "id")?)?,
        }),
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
    let filters = where_equalities(select.selection.as_ref())?;

    match table.as_str() {
        "resource_days" => Ok(Command::SelectResourceDays {
            label: optional_filter(&filters, "label")
                .map(parse_string_expr)
                .transpose()?,
        }),
        "reservations" => {
            let filter = match (
                optional_filter(&filters, "id"),
                optional_filter(&filters, "vendor_id"),
            ) {
                (Some(id), _) => ReservationFilter::Id(parse_ulid_expr(id)?),
                (None, Some(vendor)) => ReservationFilter::Vendor(parse_ulid_expr(vendor)?),
                (None, None) => ReservationFilter::All,
            };
            Ok(Command::SelectReservations { filter })
        }
        "upcoming_reservations" => Ok(Command::SelectUpcoming),
        "availability" => Ok(Command::SelectAvailability {
            resource_day: parse_string_expr(require_filter(&filters, "resource_day")?)?,
            date: parse_date_expr(require_filter(&filters, "date")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn where_equalities(selection: Option<&Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((column, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn optional_filter<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(c, _)| c == column)
        .map(|(_, value)| *value)
}

fn require_filter<'a>(
    filters: &[(String, &'a Expr)],
    column: &'static str,
) -> Result<&'a Expr, SqlError> {
    optional_filter(filters, column).ok_or(SqlError::MissingFilter(column))
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// `'YYYY-MM-DD'`, optionally cast as `'...'::date`.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    if let Expr::Cast { expr: inner, .. } = expr {
        return parse_date_expr(inner);
    }
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("statement too long: {0} bytes")]
    TooLong(usize),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing SET {0}")]
    MissingAssignment(&'static str),
    #[error("column cannot be updated: {0}")]
    ReadOnlyColumn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parse_insert_resource_day() {
        let cmd = parse_sql("INSERT INTO resource_days (label, capacity) VALUES ('Monday', 7)").unwrap();
        assert_eq!(
            cmd,
            Command::InsertResourceDay {
                label: "Monday".into(),
                capacity: 7
            }
        );
    }

    #[test]
    fn negative_capacity_reaches_the_engine() {
        let cmd = parse_sql("INSERT INTO resource_days (label, capacity) VALUES ('Monday', -1)").unwrap();
        assert!(matches!(cmd, Command::InsertResourceDay { capacity: -1, .. }));
    }

    #[test]
    fn parse_update_resource_day() {
        let cmd = parse_sql("UPDATE resource_days SET capacity = 4 WHERE label = 'Friday'").unwrap();
        assert_eq!(
            cmd,
            Command::UpdateResourceDay {
                label: "Friday".into(),
                capacity: 4
            }
        );
    }

    #[test]
    fn update_resource_day_rejects_other_columns() {
        let err = parse_sql("UPDATE resource_days SET label = 'x' WHERE label = 'Friday'").unwrap_err();
        assert!(matches!(err, SqlError::ReadOnlyColumn(c) if c == "label"));
    }

    #[test]
    fn parse_select_resource_days() {
        assert_eq!(
            parse_sql("SELECT * FROM resource_days").unwrap(),
            Command::SelectResourceDays { label: None }
        );
        assert_eq!(
            parse_sql("SELECT id, label FROM resource_days WHERE label = 'Sunday'").unwrap(),
            Command::SelectResourceDays {
                label: Some("Sunday".into())
            }
        );
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            "INSERT INTO reservations (vendor_id, resource_day, date) VALUES ('{ID}', 'Monday', '2030-03-04')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertReservation {
                vendor_id: Ulid::from_string(ID).unwrap(),
                resource_day: "Monday".into(),
                date: d(2030, 3, 4),
            }
        );
    }

    #[test]
    fn parse_insert_reservation_with_date_cast() {
        let sql = format!(
            "INSERT INTO reservations (vendor_id, resource_day, date) VALUES ('{ID}', 'Monday', '2030-03-04'::date)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertReservation { date, .. } if date == d(2030, 3, 4)
        ));
    }

    #[test]
    fn insert_reservation_arity_and_values_checked() {
        let short = format!("INSERT INTO reservations (vendor_id, resource_day) VALUES ('{ID}', 'Monday')");
        assert!(matches!(
            parse_sql(&short),
            Err(SqlError::WrongArity("reservations", 3, 2))
        ));
        let bad_date = format!(
            "INSERT INTO reservations (vendor_id, resource_day, date) VALUES ('{ID}', 'Monday', '2030-02-30')"
        );
        assert!(matches!(parse_sql(&bad_date), Err(SqlError::Parse(_))));
        let bad_id = "INSERT INTO reservations (vendor_id, resource_day, date) VALUES ('nope', 'Monday', '2030-03-04')";
        assert!(matches!(parse_sql(bad_id), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_update_reservation() {
        let sql = format!("UPDATE reservations SET date = '2030-03-05' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateReservation {
                id: Ulid::from_string(ID).unwrap(),
                resource_day: None,
                date: Some(d(2030, 3, 5)),
            }
        );

        let sql = format!(
            "UPDATE reservations SET resource_day = 'Tuesday', date = '2030-03-05' WHERE id = '{ID}'"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::UpdateReservation { resource_day: Some(ref day), date: Some(_), .. } if day == "Tuesday"
        ));
    }

    #[test]
    fn update_reservation_requires_id() {
        let err = parse_sql("UPDATE reservations SET date = '2030-03-05'").unwrap_err();
        assert!(matches!(err, SqlError::MissingFilter("id")));
        let err = parse_sql(&format!("UPDATE reservations SET vendor_id = '{ID}' WHERE id = '{ID}'"))
            .unwrap_err();
        assert!(matches!(err, SqlError::ReadOnlyColumn(_)));
    }

    #[test]
    fn parse_delete_reservation() {
        let cmd = parse_sql(&format!("DELETE FROM reservations WHERE id = '{ID}'")).unwrap();
        assert_eq!(
            cmd,
            Command::DeleteReservation {
                id: Ulid::from_string(ID).unwrap()
            }
        );
        assert!(matches!(
            parse_sql("DELETE FROM reservations"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_select_reservations_filters() {
        let id = Ulid::from_string(ID).unwrap();
        assert_eq!(
            parse_sql("SELECT * FROM reservations").unwrap(),
            Command::SelectReservations {
                filter: ReservationFilter::All
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM reservations WHERE id = '{ID}'")).unwrap(),
            Command::SelectReservations {
                filter: ReservationFilter::Id(id)
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM reservations WHERE vendor_id = '{ID}'")).unwrap(),
            Command::SelectReservations {
                filter: ReservationFilter::Vendor(id)
            }
        );
    }

    #[test]
    fn parse_select_upcoming() {
        assert_eq!(
            parse_sql("SELECT * FROM upcoming_reservations").unwrap(),
            Command::SelectUpcoming
        );
    }

    #[test]
    fn parse_select_availability() {
        let cmd =
            parse_sql("SELECT * FROM availability WHERE resource_day = 'Friday' AND date = '2030-03-08'")
                .unwrap();
        assert_eq!(
            cmd,
            Command::SelectAvailability {
                resource_day: "Friday".into(),
                date: d(2030, 3, 8),
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM availability WHERE resource_day = 'Friday'"),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn non_equality_filters_are_refused() {
        let err = parse_sql("SELECT * FROM reservations WHERE date > '2030-01-01'").unwrap_err();
        assert!(matches!(err, SqlError::Unsupported(_)));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let err = parse_sql("SELECT * FROM vendors").unwrap_err();
        assert!(matches!(err, SqlError::UnknownTable(t) if t == "vendors"));
    }

    #[test]
    fn parse_empty_and_multiple_statements() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(
            parse_sql("SELECT * FROM reservations; SELECT * FROM reservations"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn overlong_statement_is_refused() {
        let sql = format!("SELECT * FROM resource_days WHERE label = '{}'", "x".repeat(MAX_SQL_LEN));
        assert!(matches!(parse_sql(&sql), Err(SqlError::TooLong(_))));
    }
}
