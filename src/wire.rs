use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
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
use tracing::{debug, warn};

use crate::auth::{self, BookMyRoomAuthSource};
use crate::guard::Actor;
use crate::model::*;
use crate::observability;
use crate::service::{ErrorKind, ReservationService, ServiceError};
use crate::sql::{self, Command, SqlError};

pub struct BookMyRoomHandler {
    service: Arc<ReservationService>,
    query_parser: Arc<BookMyRoomQueryParser>,
}

impl BookMyRoomHandler {
    pub fn new(service: Arc<ReservationService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(BookMyRoomQueryParser),
        }
    }

    /// The actor named by the session credential. Re-verified on every
    /// statement so expiry takes effect mid-session.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> Result<Option<Actor>, ServiceError> {
        let Some(token) = auth::session_token(client) else {
            return Ok(None);
        };
        self.service.authenticate(&token).map(Some).inspect_err(|_| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        })
    }

    async fn run<C: ClientInfo + Send + Sync>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(client, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        result.map_err(|e| {
            debug!(command = label, "statement failed: {e}");
            service_err(e)
        })
    }

    async fn execute_command<C: ClientInfo + Send + Sync>(
        &self,
        client: &mut C,
        cmd: Command,
    ) -> Result<Response, ServiceError> {
        let service = &self.service;
        match cmd {
            Command::Register { id, email, password } => {
                service.register(id, &email, &password).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Login { email, password } => {
                let token = service.login(&email, &password).await.inspect_err(|e| {
                    if e.kind() == ErrorKind::Authentication {
                        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    }
                })?;
                let schema = Arc::new(token_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&token).map_err(encode_err)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SetSessionAuthorization { token } => {
                if let Err(e) = service.authenticate(&token) {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    warn!("rejected session credential: {e}");
                    return Err(e);
                }
                auth::set_session_token(client, token);
                Ok(Response::Execution(Tag::new("SET")))
            }
            Command::ResetSessionAuthorization => {
                auth::clear_session_token(client);
                Ok(Response::Execution(Tag::new("RESET")))
            }
            Command::SetUserRole { id, role } => {
                let actor = self.resolve_actor(client)?;
                service.set_user_role(actor.as_ref(), id, role).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertRoom { id, draft } => {
                let actor = self.resolve_actor(client)?;
                service.create_room(actor.as_ref(), id, draft).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateRoom { id, draft } => {
                let actor = self.resolve_actor(client)?;
                service.update_room(actor.as_ref(), id, draft).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                let actor = self.resolve_actor(client)?;
                service.delete_room(actor.as_ref(), id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => vec![service.get_room(id).await?],
                    None => service.list_rooms().await,
                };
                room_rows(rooms)
            }
            Command::InsertBooking {
                id,
                room_id,
                start,
                end,
            } => {
                let actor = self.resolve_actor(client)?;
                service
                    .create_booking(actor.as_ref(), id, room_id, start, end)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectRoomBookings { room_id } => {
                booking_rows(service.list_room_bookings(room_id).await?)
            }
            Command::SelectBooking { id } => {
                let actor = self.resolve_actor(client)?;
                booking_rows(vec![service.get_booking(actor.as_ref(), id).await?])
            }
            Command::SelectMyBookings => {
                let actor = self.resolve_actor(client)?;
                booking_rows(service.list_my_bookings(actor.as_ref()).await?)
            }
            Command::UpdateBookingStatus { id, status } => {
                let actor = self.resolve_actor(client)?;
                service
                    .update_booking_status(actor.as_ref(), id, status)
                    .await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                let actor = self.resolve_actor(client)?;
                service.cancel_booking(actor.as_ref(), id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

/// Instants leave the server as RFC 3339 UTC with millisecond precision.
pub fn format_instant(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn room_rows(rooms: Vec<RoomInfo>) -> Result<Response, ServiceError> {
    let schema = Arc::new(room_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .into_iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.name)?;
            encoder.encode_field(&room.description)?;
            encoder.encode_field(&i64::from(room.capacity))?;
            encoder.encode_field(&room.photo_url)?;
            encoder.encode_field(&room.is_active)?;
            encoder.encode_field(&format_instant(room.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: Vec<Booking>) -> Result<Response, ServiceError> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id.to_string())?;
            encoder.encode_field(&b.owner_id.to_string())?;
            encoder.encode_field(&format_instant(b.span.start))?;
            encoder.encode_field(&format_instant(b.span.end))?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&format_instant(b.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("photo_url", Type::VARCHAR),
        text_field("is_active", Type::BOOL),
        text_field("created_at", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("room_id", Type::VARCHAR),
        text_field("owner_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
    ]
}

fn token_schema() -> Vec<FieldInfo> {
    vec![text_field("token", Type::VARCHAR)]
}

/// Result columns for a statement, judged from its text before parameters
/// are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("TOKENS") {
        token_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else if upper.contains("ROOMS") {
        room_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for BookMyRoomHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
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
pub struct BookMyRoomQueryParser;

#[async_trait]
impl QueryParser for BookMyRoomQueryParser {
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
impl ExtendedQueryHandler for BookMyRoomHandler {
    type Statement = String;
    type QueryParser = BookMyRoomQueryParser;

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
        let sql = substitute_params(portal);
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


/// `(byte range, N)` of every `$N` placeholder outside quoted text.
/// `''` inside a string literal is an escaped quote, not a terminator.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass, so a bound value is never scanned again.
/// A placeholder with no matching parameter is left as written.
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

// ── Factory ──────────────────────────────────────────────────────

pub struct BookMyRoomFactory {
    handler: Arc<BookMyRoomHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<BookMyRoomAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BookMyRoomFactory {
    pub fn new(service: Arc<ReservationService>, password: String) -> Self {
        let auth_source = BookMyRoomAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookMyRoomHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookMyRoomFactory {
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
    service: Arc<ReservationService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = BookMyRoomFactory::new(service, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each failure kind.
pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::Authentication => "28000",
        ErrorKind::Forbidden => "42501",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "23P01",
        ErrorKind::InvalidTransition => "55000",
        ErrorKind::AlreadyExists => "23505",
        ErrorKind::Internal => "XX000",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn service_err(e: ServiceError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue { .. } => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

fn encode_err(e: PgWireError) -> ServiceError {
    ServiceError::Internal(format!("encode error: {e}"))
}
