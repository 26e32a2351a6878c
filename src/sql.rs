use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertMetadata {
        metadata: ResourceMetadata,
    },
    /// `id = None` lists every resource.
    SelectMetadata {
        id: Option<ResourceId>,
    },
    InsertReservation {
        /// Generated when the caller leaves it out.
        record_id: Option<RecordId>,
        resource_id: ResourceId,
        requester_id: RequesterId,
        start: Ms,
        end: Ms,
        /// Anything but CONFIRMED is refused by the store.
        confirmed: bool,
    },
    DeleteReservation {
        record_id: RecordId,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectAvailability {
        resource_id: ResourceId,
        /// Defaults to the server clock.
        as_of: Option<Ms>,
    },
    SelectCubicle {
        id: ResourceId,
    },
    SelectReadiness,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReservationFilter {
    Record(RecordId),
    Resource(ResourceId),
}

const METADATA_COLUMNS: &[&str] = &["id", "name", "location", "capacity"];
const RESERVATION_COLUMNS: &[&str] = &[
    "record_id",
    "resource_id",
    "requester_id",
    "start",
    "end",
    "status",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "metadata" => {
            let row = InsertRow::new(insert, "metadata", METADATA_COLUMNS)?;
            Ok(Command::InsertMetadata {
                metadata: ResourceMetadata {
                    id: parse_string(row.required("id")?)?,
                    name: parse_string(row.required("name")?)?,
                    location: match row.get("location") {
                        Some(expr) => parse_string_or_null(expr)?.unwrap_or_default(),
                        None => String::new(),
                    },
                    capacity: parse_u32(row.required("capacity")?)?,
                },
            })
        }
        "reservations" => {
            let row = InsertRow::new(insert, "reservations", RESERVATION_COLUMNS)?;
            let record_id = match row.get("record_id") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            let confirmed = match row.get("status") {
                Some(expr) => parse_status(expr)?,
                None => true,
            };
            Ok(Command::InsertReservation {
                record_id,
                resource_id: parse_string(row.required("resource_id")?)?,
                requester_id: parse_string(row.required("requester_id")?)?,
                start: parse_instant(row.required("start")?)?,
                end: parse_instant(row.required("end")?)?,
                confirmed,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::Unsupported(format!("DELETE FROM {table}")));
    }
    let filters = Filters::from_selection(delete.selection.as_ref(), &["record_id"])?;
    Ok(Command::DeleteReservation {
        record_id: filters.required_string("record_id")?,
    })
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
    let selection = select.selection.as_ref();

    match table.as_str() {
        "metadata" => {
            let filters = Filters::from_selection(selection, &["id"])?;
            Ok(Command::SelectMetadata {
                id: filters.optional_string("id")?,
            })
        }
        "reservations" => {
            let filters = Filters::from_selection(selection, &["record_id", "resource_id"])?;
            let filter = match (
                filters.optional_string("record_id")?,
                filters.optional_string("resource_id")?,
            ) {
                (Some(id), None) => ReservationFilter::Record(id),
                (None, Some(id)) => ReservationFilter::Resource(id),
                (None, None) => return Err(SqlError::MissingFilter("record_id or resource_id")),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported(
                        "filter by record_id or resource_id, not both".into(),
                    ));
                }
            };
            Ok(Command::SelectReservations { filter })
        }
        "availability" => {
            let filters = Filters::from_selection(selection, &["resource_id", "as_of"])?;
            Ok(Command::SelectAvailability {
                resource_id: filters.required_string("resource_id")?,
                as_of: filters.get("as_of").map(parse_instant).transpose()?,
            })
        }
        "cubicles" => {
            let filters = Filters::from_selection(selection, &["id"])?;
            Ok(Command::SelectCubicle {
                id: filters.required_string("id")?,
            })
        }
        "readiness" => {
            Filters::from_selection(selection, &[])?;
            Ok(Command::SelectReadiness)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Row and filter access ─────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the table's
/// own column order applies.
struct InsertRow<'a> {
    values: Vec<(String, &'a Expr)>,
}

impl<'a> InsertRow<'a> {
    fn new(
        insert: &'a ast::Insert,
        table: &'static str,
        columns: &[&str],
    ) -> Result<Self, SqlError> {
        let row = single_insert_row(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            if row.len() > columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            columns.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != row.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
            }
            let names: Vec<String> = insert
                .columns
                .iter()
                .map(|ident| ident.value.to_lowercase())
                .collect();
            for (i, name) in names.iter().enumerate() {
                if !columns.contains(&name.as_str()) {
                    return Err(SqlError::UnknownColumn(name.clone()));
                }
                if names[..i].contains(name) {
                    return Err(SqlError::Parse(format!("column {name} given twice")));
                }
            }
            names
        };
        Ok(Self {
            values: names.into_iter().zip(row.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// `col = value` conditions joined by AND.
struct Filters<'a> {
    equalities: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>, allowed: &[&str]) -> Result<Self, SqlError> {
        let mut filters = Self {
            equalities: Vec::new(),
        };
        if let Some(expr) = selection {
            filters.collect(expr, allowed)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr, allowed: &[&str]) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner, allowed),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left, allowed)?;
                self.collect(right, allowed)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                if !allowed.contains(&col.as_str()) {
                    return Err(SqlError::UnknownColumn(col));
                }
                self.equalities.push((col, &**right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.equalities
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string).transpose()
    }

    fn required_string(&self, column: &'static str) -> Result<String, SqlError> {
        self.optional_string(column)?
            .ok_or(SqlError::MissingFilter(column))
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

fn single_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Integer Unix milliseconds, or an RFC 3339 string in any offset
/// (normalized to UTC).
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Ok(ms) = s.trim().parse::<Ms>() {
            return Ok(ms);
        }
        return chrono::DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad instant {s}: {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_status(expr: &Expr) -> Result<bool, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(true),
        Some(s) => match s.to_ascii_uppercase().as_str() {
            "CONFIRMED" => Ok(true),
            "CANCELLED" => Ok(false),
            _ => Err(SqlError::Parse(format!("unknown status {s}"))),
        },
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
