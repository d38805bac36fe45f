use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{CoworkdAuthSource, caller_from_user};
use crate::engine::{CalendarView, Engine, EngineError, now_ms};
use crate::limits::*;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::space::SpaceManager;
use crate::sql::{self, Command, SqlError};

pub struct CoworkdHandler {
    spaces: Arc<SpaceManager>,
    query_parser: Arc<CoworkdQueryParser>,
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

impl CoworkdHandler {
    pub fn new(spaces: Arc<SpaceManager>) -> Self {
        Self {
            spaces,
            query_parser: Arc::new(CoworkdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let space = client
            .metadata()
            .get("database")
            .map(String::as_str)
            .unwrap_or("default");
        self.spaces
            .get_or_create(space)
            .map_err(|e| user_error("08006", format!("space error: {e}")))
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let user = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        caller_from_user(user).ok_or_else(|| user_error("28000", format!("unknown user {user:?}")))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let caller = self.resolve_caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&engine, &caller, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }
}

fn window(start: Option<Ms>, end: Option<Ms>) -> PgWireResult<Option<Span>> {
    if start.is_none() && end.is_none() {
        return Ok(None);
    }
    let span = Span::try_new(
        start.unwrap_or(MIN_VALID_TIMESTAMP_MS),
        end.unwrap_or(MAX_VALID_TIMESTAMP_MS),
    )
    .map_err(|e| engine_err(e.into()))?;
    Ok(Some(span))
}

async fn execute_command(engine: &Engine, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
    let executed = |verb: &str, rows: usize| Response::Execution(Tag::new(verb).with_rows(rows));
    match cmd {
        Command::InsertResource { id, name, kind, capacity } => {
            engine
                .create_resource(caller, id, name, kind, capacity)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT", 1))
        }
        Command::UpdateResource { id, patch } => {
            engine.update_resource(caller, id, patch).await.map_err(engine_err)?;
            Ok(executed("UPDATE", 1))
        }
        Command::SelectResources => Ok(resource_rows(engine.list_resources().await)),
        Command::InsertMember { id, name, email } => {
            engine
                .create_member(caller, id, name, email)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT", 1))
        }
        Command::UpdateMember { id, patch } => {
            engine.update_member(caller, id, patch).await.map_err(engine_err)?;
            Ok(executed("UPDATE", 1))
        }
        Command::SelectMembers => Ok(member_rows(engine.list_members())),
        Command::InsertBooking(b) => {
            engine
                .create_booking(caller, b.id, b.resource_id, b.member_id, b.start, b.end, b.status)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT", 1))
        }
        Command::BatchInsertBookings(batch) => {
            let created = engine
                .batch_create_bookings(caller, batch)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT", created.len()))
        }
        Command::UpdateBookingStatus { id, status } => {
            engine
                .update_booking_status(caller, id, status)
                .await
                .map_err(engine_err)?;
            Ok(executed("UPDATE", 1))
        }
        Command::RescheduleBooking { id, change } => {
            engine
                .reschedule_booking(caller, id, change)
                .await
                .map_err(engine_err)?;
            Ok(executed("UPDATE", 1))
        }
        Command::DeleteBooking { id } => {
            engine.delete_booking(caller, id).await.map_err(engine_err)?;
            Ok(executed("DELETE", 1))
        }
        Command::SelectBooking { id } => {
            let booking = engine.get_booking(id).await.map_err(engine_err)?;
            Ok(booking_rows(vec![booking], now_ms()))
        }
        Command::SelectBookings { resource_ids, start, end } => {
            let bookings = engine
                .list_bookings(resource_ids.as_deref(), window(start, end)?)
                .await
                .map_err(engine_err)?;
            Ok(booking_rows(bookings, now_ms()))
        }
        Command::SelectAvailability { resource_id, start, end, min_duration } => {
            let free = engine
                .free_spans(resource_id, start, end, min_duration)
                .await
                .map_err(engine_err)?;
            Ok(rows_response(availability_schema(), free, |enc, span| {
                enc.encode_field(&resource_id.to_string())?;
                enc.encode_field(&span.start)?;
                enc.encode_field(&span.end)
            }))
        }
        Command::SelectFirstAvailable { resource_ids, start, end } => {
            let found = engine
                .first_available(resource_ids.as_deref(), start, end)
                .await
                .map_err(engine_err)?;
            Ok(resource_rows(found.into_iter().collect()))
        }
        Command::SelectFreeBusy { resource_ids, start, end, granularity_minutes } => {
            let grid = engine
                .free_busy_grid(resource_ids.as_deref(), start, end, granularity_minutes)
                .await
                .map_err(engine_err)?;
            let cells: Vec<_> = grid
                .into_iter()
                .flat_map(|row| {
                    let (id, name) = (row.resource_id.to_string(), row.name);
                    row.slots
                        .into_iter()
                        .map(move |slot| (id.clone(), name.clone(), slot))
                })
                .collect();
            Ok(rows_response(free_busy_schema(), cells, |enc, (id, name, slot)| {
                enc.encode_field(&id)?;
                enc.encode_field(&name)?;
                enc.encode_field(&slot.span.start)?;
                enc.encode_field(&slot.span.end)?;
                enc.encode_field(&slot.busy)
            }))
        }
        Command::SelectCalendar { week, slot_minutes } => {
            let view = CalendarView {
                slot_minutes: slot_minutes.unwrap_or(CalendarView::default().slot_minutes),
                ..CalendarView::default()
            };
            let grid = engine
                .week_calendar(week, &view, now_ms())
                .await
                .map_err(engine_err)?;
            let mut cells = Vec::with_capacity(grid.rows.len() * grid.columns.len());
            for row in &grid.rows {
                for (column, cell) in grid.columns.iter().zip(&row.cells) {
                    cells.push((row.slot, column.clone(), cell.clone()));
                }
            }
            Ok(rows_response(calendar_schema(), cells, |enc, (slot, column, cell)| {
                enc.encode_field(&slot.start)?;
                enc.encode_field(&slot.end)?;
                enc.encode_field(&column.resource_id.to_string())?;
                enc.encode_field(&column.name)?;
                enc.encode_field(&cell.as_ref().map(|c| c.booking_id.to_string()))?;
                enc.encode_field(&cell.as_ref().map(|c| c.member_id.to_string()))?;
                enc.encode_field(&cell.as_ref().and_then(|c| c.member_name.clone()))?;
                enc.encode_field(&cell.as_ref().map(|c| c.status.as_str().to_string()))?;
                enc.encode_field(&cell.as_ref().map(|c| c.more as i64))
            }))
        }
        Command::SelectUpcoming { count } => {
            let now = now_ms();
            Ok(booking_rows(engine.upcoming_bookings(now, count).await, now))
        }
        Command::SelectOccupancy { start, end } => {
            let occ = engine.occupancy(start, end).await.map_err(engine_err)?;
            Ok(rows_response(occupancy_schema(), vec![occ], |enc, occ| {
                enc.encode_field(&occ.window.start)?;
                enc.encode_field(&occ.window.end)?;
                enc.encode_field(&occ.booked_ms)?;
                enc.encode_field(&occ.available_ms)?;
                enc.encode_field(&occ.rate)
            }))
        }
        Command::SelectInUse => {
            let in_use = engine.resources_in_use(now_ms()).await;
            Ok(rows_response(in_use_schema(), in_use, |enc, (resource, booking)| {
                enc.encode_field(&resource.id.to_string())?;
                enc.encode_field(&resource.name)?;
                enc.encode_field(&booking.id.to_string())?;
                enc.encode_field(&booking.member_id.to_string())?;
                enc.encode_field(&booking.span.end)
            }))
        }
    }
}

// ── Row encoding ────────────────────────────────────────────────

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn resource_rows(resources: Vec<Resource>) -> Response {
    rows_response(resources_schema(), resources, |enc, r| {
        enc.encode_field(&r.id.to_string())?;
        enc.encode_field(&r.name)?;
        enc.encode_field(&r.kind.as_str().to_string())?;
        enc.encode_field(&i64::from(r.capacity))?;
        enc.encode_field(&r.active)
    })
}

fn member_rows(members: Vec<Member>) -> Response {
    rows_response(members_schema(), members, |enc, m| {
        enc.encode_field(&m.id.to_string())?;
        enc.encode_field(&m.name)?;
        enc.encode_field(&m.email)?;
        enc.encode_field(&m.active)
    })
}

fn booking_rows(bookings: Vec<Booking>, now: Ms) -> Response {
    rows_response(bookings_schema(), bookings, move |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.resource_id.to_string())?;
        enc.encode_field(&b.member_id.to_string())?;
        enc.encode_field(&b.span.start)?;
        enc.encode_field(&b.span.end)?;
        enc.encode_field(&b.effective_status(now).as_str().to_string())?;
        enc.encode_field(&b.created_at)
    })
}

// ── Schemas ─────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("active", Type::BOOL),
    ]
}

fn members_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("member_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn free_busy_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("busy", Type::BOOL),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("slot_start", Type::INT8),
        field("slot_end", Type::INT8),
        field("resource_id", Type::VARCHAR),
        field("resource_name", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("member_id", Type::VARCHAR),
        field("member_name", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("more", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("booked_ms", Type::INT8),
        field("available_ms", Type::INT8),
        field("rate", Type::FLOAT8),
    ]
}

fn in_use_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("member_id", Type::VARCHAR),
        field("until", Type::INT8),
    ]
}

/// Result columns of a statement, judged from its FROM table. Used for
/// Describe, where parameters are still unbound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split(|c: char| c.is_whitespace() || c == ';' || c == ',');
    if words.next() != Some("select") {
        return Vec::new();
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches('"'));
    match table {
        Some("resources" | "first_available") => resources_schema(),
        Some("members") => members_schema(),
        Some("bookings" | "upcoming") => bookings_schema(),
        Some("availability") => availability_schema(),
        Some("free_busy") => free_busy_schema(),
        Some("calendar") => calendar_schema(),
        Some("occupancy") => occupancy_schema(),
        Some("in_use") => in_use_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for CoworkdHandler {
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
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CoworkdQueryParser;

#[async_trait]
impl QueryParser for CoworkdQueryParser {
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
impl ExtendedQueryHandler for CoworkdHandler {
    type Statement = String;
    type QueryParser = CoworkdQueryParser;

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
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(client, &sql).await
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

/// `$N` placeholders outside quoted literals and identifiers, as
/// (byte range, N).
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote is an escaped one; scanning on finds it.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one left-to-right
/// pass, so bound values are never rescanned.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[last..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CoworkdFactory {
    handler: Arc<CoworkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CoworkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CoworkdFactory {
    pub fn new(spaces: Arc<SpaceManager>, password: String) -> Self {
        Self {
            handler: Arc::new(CoworkdHandler::new(spaces)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CoworkdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CoworkdFactory {
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
    spaces: Arc<SpaceManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CoworkdFactory::new(spaces, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInterval { .. } => "22007",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidTransition { .. } | EngineError::Inactive(_) => "55000",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::OutOfRange(_) => "22003",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
