use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::NodeAuthSource;
use crate::clock::Clock;
use crate::error::Error;
use crate::model::*;
use crate::node::Node;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, ReservationFilter};
use crate::store::validate_span;

pub struct NodeHandler {
    node: Arc<Node>,
    query_parser: Arc<NodeQueryParser>,
}

impl NodeHandler {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            query_parser: Arc::new(NodeQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(cmd).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => {
                tracing::debug!(command = label, "query failed: {e}");
                "error"
            }
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(node_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, Error> {
        let node = &self.node;
        match cmd {
            Command::InsertMetadata { metadata } => {
                node.metadata()?
                    .create_metadata(metadata, node.deadline())
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectMetadata { id: Some(id) } => {
                let metadata = node.metadata()?.get_metadata(&id, node.deadline()).await?;
                Ok(rows_response(metadata_schema(), &[metadata], encode_metadata))
            }
            Command::SelectMetadata { id: None } => {
                let all = node.metadata()?.list_metadata(node.deadline()).await?;
                Ok(rows_response(metadata_schema(), &all, encode_metadata))
            }
            Command::InsertReservation {
                record_id,
                resource_id,
                requester_id,
                start,
                end,
                confirmed,
            } => {
                let store = node.reservations()?;
                if !confirmed {
                    return Err(Error::Validation("new reservations must be CONFIRMED".into()));
                }
                let span = validate_span(start, end)?;
                let record_id = record_id.unwrap_or_else(|| Ulid::new().to_string());
                let record =
                    ReservationRecord::confirmed(record_id, resource_id, requester_id, span);
                let record_id = store.create_reservation(record, node.deadline()).await?;
                // Behaves like INSERT ... RETURNING record_id.
                Ok(rows_response(record_id_schema(), &[record_id], |enc, id| {
                    enc.encode_field(id)
                }))
            }
            Command::DeleteReservation { record_id } => {
                let cancelled = node
                    .reservations()?
                    .cancel_reservation(&record_id, node.clock().now_ms(), node.deadline())
                    .await?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(cancelled)),
                ))
            }
            Command::SelectReservations { filter } => {
                let store = node.reservations()?;
                let records = match filter {
                    ReservationFilter::Record(id) => {
                        vec![store.get_reservation(&id, node.deadline()).await?]
                    }
                    ReservationFilter::Resource(id) => {
                        store.list_reservations(&id, node.deadline()).await?
                    }
                };
                Ok(rows_response(reservation_schema(), &records, encode_reservation))
            }
            Command::SelectAvailability { resource_id, as_of } => {
                let engine = node.availability()?;
                let as_of = as_of.unwrap_or_else(|| node.clock().now_ms());
                let result = engine
                    .check_availability(&resource_id, as_of, node.deadline())
                    .await?;
                Ok(rows_response(
                    availability_schema(),
                    &[(resource_id, result)],
                    |enc, (id, result)| {
                        enc.encode_field(id)?;
                        encode_availability(enc, result)
                    },
                ))
            }
            Command::SelectCubicle { id } => {
                let view = node
                    .orchestrator()?
                    .get_cubicle_details(&id, node.deadline())
                    .await?;
                Ok(rows_response(cubicle_schema(), &[view], |enc, view| {
                    encode_metadata(enc, &view.metadata)?;
                    encode_availability(enc, &view.availability)
                }))
            }
            Command::SelectReadiness => {
                let (ready, detail) = node.readiness();
                Ok(rows_response(readiness_schema(), &[(ready, detail)], |enc, (ready, d)| {
                    enc.encode_field(ready)?;
                    enc.encode_field(&d.metadata)?;
                    enc.encode_field(&d.availability)
                }))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_metadata(enc: &mut DataRowEncoder, m: &ResourceMetadata) -> PgWireResult<()> {
    enc.encode_field(&m.id)?;
    enc.encode_field(&m.name)?;
    enc.encode_field(&m.location)?;
    enc.encode_field(&i64::from(m.capacity))
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &ReservationRecord) -> PgWireResult<()> {
    let cancelled_at = match r.status {
        ReservationStatus::Cancelled { at } => Some(at),
        ReservationStatus::Confirmed => None,
    };
    enc.encode_field(&r.record_id)?;
    enc.encode_field(&r.resource_id)?;
    enc.encode_field(&r.requester_id)?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.status.label().to_string())?;
    enc.encode_field(&cancelled_at)
}

/// `integrity_violation` carries the overlapping record ids, comma separated.
fn encode_availability(enc: &mut DataRowEncoder, a: &AvailabilityResult) -> PgWireResult<()> {
    let violation = a
        .integrity_violation
        .as_ref()
        .map(|v| v.record_ids.join(","));
    enc.encode_field(&a.available_now)?;
    enc.encode_field(&a.next_available)?;
    enc.encode_field(&violation)
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn metadata_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("capacity", Type::INT8),
    ]
}

fn record_id_schema() -> Vec<FieldInfo> {
    vec![field("record_id", Type::VARCHAR)]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("record_id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("cancelled_at", Type::INT8),
    ]
}

fn availability_columns() -> Vec<FieldInfo> {
    vec![
        field("available_now", Type::BOOL),
        field("next_available", Type::INT8),
        field("integrity_violation", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    let mut schema = vec![field("resource_id", Type::VARCHAR)];
    schema.extend(availability_columns());
    schema
}

fn cubicle_schema() -> Vec<FieldInfo> {
    let mut schema = metadata_schema();
    schema.extend(availability_columns());
    schema
}

fn readiness_schema() -> Vec<FieldInfo> {
    vec![
        field("ready", Type::BOOL),
        field("metadata", Type::BOOL),
        field("availability", Type::BOOL),
    ]
}

/// Result columns a statement will produce, guessed from its verb and
/// table before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };
    match words.first().copied() {
        Some("SELECT") => match table_after("FROM") {
            Some("METADATA") => metadata_schema(),
            Some("RESERVATIONS") => reservation_schema(),
            Some("AVAILABILITY") => availability_schema(),
            Some("CUBICLES") => cubicle_schema(),
            Some("READINESS") => readiness_schema(),
            _ => vec![],
        },
        Some("INSERT") if table_after("INTO") == Some("RESERVATIONS") => record_id_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for NodeHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct NodeQueryParser;

#[async_trait]
impl QueryParser for NodeQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for NodeHandler {
    type Statement = String;
    type QueryParser = NodeQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside single-quoted literals, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote inside a literal toggles twice and stays inside.
            b'\'' => in_literal = !in_literal,
            b'$' if !in_literal => {
                let digits = i + 1;
                let mut end = digits;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[digits..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

fn param_literal(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

/// Splice bound values (text format) into the statement in one pass; text
/// already inserted is never scanned again.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut bound = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        bound.push_str(&sql[copied..range.start]);
        bound.push_str(&param_literal(param.as_ref().map(|p| AsRef::<[u8]>::as_ref(p))));
        copied = range.end;
    }
    bound.push_str(&sql[copied..]);
    bound
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct NodeFactory {
    handler: Arc<NodeHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<NodeAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl NodeFactory {
    pub fn new(node: Arc<Node>, password: String) -> Self {
        let auth_source = NodeAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(NodeHandler::new(node)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for NodeFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    node: Arc<Node>,
    password: String,
) -> std::io::Result<()> {
    let factory = NodeFactory::new(node, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn node_err(e: Error) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
