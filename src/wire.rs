use std::collections::HashSet;
use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, StreamExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::engine::{BookingEngine, EngineError};
use crate::model::*;
use crate::observability::{AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, ReservationFilter, SqlError};

pub struct CurbsideHandler {
    engine: Arc<BookingEngine>,
    admins: Arc<HashSet<Ulid>>,
    query_parser: Arc<CurbsideQueryParser>,
}

impl CurbsideHandler {
    pub fn new(engine: Arc<BookingEngine>, admins: Arc<HashSet<Ulid>>) -> Self {
        Self {
            engine,
            admins,
            query_parser: Arc::new(CurbsideQueryParser),
        }
    }

    /// The login user is the caller id; ids listed as admins get the admin role.
    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        let id = Ulid::from_string(&user).map_err(|_| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::debug!(user, "login user is not a caller id");
            user_error("28000", format!("login user {user:?} is not a valid caller id"))
        })?;
        Ok(if self.admins.contains(&id) {
            Caller::admin(id)
        } else {
            Caller::vendor(id)
        })
    }

    async fn execute(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResourceDay { label, capacity } => {
                let day = engine
                    .create_resource_day(&label, capacity, caller)
                    .await
                    .map_err(engine_err)?;
                resource_day_rows(stream::iter([day]))
            }
            Command::UpdateResourceDay { label, capacity } => {
                let day = engine
                    .update_resource_day(&label, capacity, caller, engine.deadline())
                    .await
                    .map_err(engine_err)?;
                resource_day_rows(stream::iter([day]))
            }
            Command::SelectResourceDays { label } => {
                resource_day_rows(engine.list_resource_days(label.as_deref()))
            }
            Command::InsertReservation {
                vendor_id,
                resource_day,
                date,
            } => {
                let reservation = engine
                    .create_reservation(vendor_id, &resource_day, date, caller, engine.deadline())
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![reservation])
            }
            Command::UpdateReservation {
                id,
                resource_day,
                date,
            } => {
                let patch = ReservationPatch {
                    resource_day: resource_day.map(DayRef::Label),
                    date,
                };
                let reservation = engine
                    .update_reservation(id, caller, patch, engine.deadline())
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![reservation])
            }
            Command::DeleteReservation { id } => {
                let deadline = engine.deadline();
                let cancelled = if caller.is_admin() {
                    engine.admin_cancel_reservation(id, deadline).await
                } else {
                    engine.cancel_reservation(id, caller, deadline).await
                };
                cancelled.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { filter } => {
                let deadline = engine.deadline();
                let reservations = match filter {
                    ReservationFilter::All => engine.list_all_reservations(caller, deadline).await,
                    ReservationFilter::Id(id) => engine
                        .get_reservation(id, caller, deadline)
                        .await
                        .map(|r| vec![r]),
                    ReservationFilter::Vendor(vendor_id) => {
                        engine
                            .list_vendor_reservations(vendor_id, caller, deadline)
                            .await
                    }
                }
                .map_err(engine_err)?;
                reservation_rows(reservations)
            }
            Command::SelectUpcoming => {
                let reservations = engine
                    .list_upcoming_reservations(engine.deadline())
                    .await
                    .map_err(engine_err)?;
                reservation_rows(reservations)
            }
            Command::SelectAvailability { resource_day, date } => {
                let availability = engine
                    .check_availability(&DayRef::Label(resource_day), date, engine.deadline())
                    .await
                    .map_err(engine_err)?;
                availability_row(availability)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn resource_day_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("label"), int_field("capacity")]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_day_id"),
        text_field("vendor_id"),
        text_field("booked_by"),
        text_field("date"),
        int_field("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_day_id"),
        text_field("date"),
        int_field("capacity"),
        int_field("booked"),
        int_field("remaining"),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

/// Row layout for a statement, picked from its verb and table name. Used to
/// describe prepared statements before their parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if lower.starts_with("delete") {
        vec![]
    } else if lower.contains("availability") {
        availability_schema()
    } else if lower.contains("resource_days") {
        resource_day_schema()
    } else if lower.contains("reservations") {
        reservation_schema()
    } else {
        vec![]
    }
}

fn resource_day_rows<S>(days: S) -> PgWireResult<Response>
where
    S: futures::Stream<Item = ResourceDay> + Send + 'static,
{
    let schema = Arc::new(resource_day_schema());
    let row_schema = schema.clone();
    let rows = days.map(move |day| -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(row_schema.clone());
        encoder.encode_field(&day.id.to_string())?;
        encoder.encode_field(&day.label)?;
        encoder.encode_field(&i64::from(day.capacity))?;
        Ok(encoder.take_row())
    });
    Ok(Response::Query(QueryResponse::new(schema, rows)))
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<DataRow>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_day_id.to_string())?;
            encoder.encode_field(&r.vendor_id.to_string())?;
            encoder.encode_field(&r.booked_by.to_string())?;
            encoder.encode_field(&r.date.to_string())?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn availability_row(a: Availability) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.resource_day_id.to_string())?;
    encoder.encode_field(&a.date.to_string())?;
    encoder.encode_field(&i64::from(a.capacity))?;
    encoder.encode_field(&i64::from(a.booked))?;
    encoder.encode_field(&i64::from(a.remaining()))?;
    encoder.encode_field(&a.is_available())?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for CurbsideHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute(&caller, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CurbsideQueryParser;

#[async_trait]
impl QueryParser for CurbsideQueryParser {
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
impl ExtendedQueryHandler for CurbsideHandler {
    type Statement = String;
    type QueryParser = CurbsideQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(&caller, cmd).await
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

/// Byte ranges and indices of `$N` placeholders outside quoted literals
/// and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // '' inside a literal closes and reopens it, which scans the same.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Replace each placeholder with its bound value (text format) in one pass,
/// so bound values are never rescanned. Placeholders without a value are
/// left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Auth ─────────────────────────────────────────────────────────

/// Shared cleartext password. Identity comes from the login user, not from
/// the password.
#[derive(Debug)]
pub struct CurbsideAuthSource {
    password: String,
}

impl CurbsideAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CurbsideAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CurbsideFactory {
    handler: Arc<CurbsideHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CurbsideAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CurbsideFactory {
    pub fn new(engine: Arc<BookingEngine>, admins: Arc<HashSet<Ulid>>, password: String) -> Self {
        Self {
            handler: Arc::new(CurbsideHandler::new(engine, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CurbsideAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CurbsideFactory {
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
    engine: Arc<BookingEngine>,
    admins: Arc<HashSet<Ulid>>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = CurbsideFactory::new(engine, admins, password);
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(|e| io::Error::other(e.to_string()))
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidDate { .. }
        | EngineError::InvalidCapacity(_)
        | EngineError::InvalidLabel(_) => "22023",
        EngineError::Forbidden => "42501",
        EngineError::NotFound(_) | EngineError::ResourceDayNotFound(_) => "P0002",
        EngineError::DuplicateLabel(_) => "23505",
        EngineError::VendorAlreadyBooked { .. } | EngineError::CapacityExceeded { .. } => "23P01",
        EngineError::StorageUnavailable(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::TooLong(_) => "54000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
