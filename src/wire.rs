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
use tracing::debug;
use ulid::Ulid;

use crate::access::AccessPolicy;
use crate::auth::RoomkeeperAuthSource;
use crate::engine::{EffectiveHours, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

pub struct RoomkeeperHandler {
    engine: Arc<Engine>,
    access: AccessPolicy,
    query_parser: Arc<RoomkeeperQueryParser>,
}

impl RoomkeeperHandler {
    pub fn new(engine: Arc<Engine>, access: AccessPolicy) -> Self {
        Self {
            engine,
            access,
            query_parser: Arc::new(RoomkeeperQueryParser),
        }
    }

    /// The login user name is the numeric user id.
    fn actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        user.parse::<UserId>().map(Actor::new).map_err(|_| {
            user_error("28000", format!("user name must be a numeric user id, got {user:?}"))
        })
    }

    async fn run(&self, actor: Actor, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, actor: Actor, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        let access = &self.access;
        debug!(actor = actor.id, ?cmd, "execute");

        match cmd {
            // ── Rooms ────────────────────────────────────────
            Command::InsertRoom { id, draft } => {
                access.can_edit_calendar(&actor)?;
                let room = engine
                    .create_room(id.unwrap_or_else(Ulid::new), draft, actor)
                    .await?;
                Ok(room_rows(vec![room]))
            }
            Command::UpdateRoom { id, patch } => {
                access.can_edit_calendar(&actor)?;
                let room = engine.update_room(id, patch, actor).await?;
                Ok(room_rows(vec![room]))
            }
            Command::DeleteRoom { id } => {
                let room = engine.get_room(id).await?;
                access.can_delete_room(&actor, &room)?;
                engine.delete_room(id, actor).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRooms { id } => {
                access.can_read(&actor)?;
                let rooms = match id {
                    Some(id) => match engine.get_room(id).await {
                        Ok(room) => vec![room],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(e),
                    },
                    None => engine.list_rooms().await,
                };
                Ok(room_rows(rooms))
            }

            // ── Operating hours ──────────────────────────────
            Command::InsertOperatingHour { id, draft } => {
                access.can_edit_calendar(&actor)?;
                let hour = engine
                    .create_operating_hour(id.unwrap_or_else(Ulid::new), draft, actor)
                    .await?;
                Ok(hour_rows(vec![hour]))
            }
            Command::UpdateOperatingHour { id, patch } => {
                access.can_edit_calendar(&actor)?;
                let hour = engine.update_operating_hour(id, patch, actor).await?;
                Ok(hour_rows(vec![hour]))
            }
            Command::DeleteOperatingHour { id } => {
                access.can_delete_calendar_entry(&actor)?;
                engine.delete_operating_hour(id, actor).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectOperatingHours { room_id } => {
                access.can_read(&actor)?;
                let mut hours = Vec::new();
                for room_id in self.rooms_in_scope(room_id).await {
                    hours.extend(engine.list_operating_hours(room_id).await?);
                }
                Ok(hour_rows(hours))
            }

            // ── Exceptions ───────────────────────────────────
            Command::InsertException { id, draft } => {
                access.can_edit_calendar(&actor)?;
                let exception = engine
                    .create_exception(id.unwrap_or_else(Ulid::new), draft, actor)
                    .await?;
                Ok(exception_rows(vec![exception]))
            }
            Command::UpdateException { id, patch } => {
                access.can_edit_calendar(&actor)?;
                let exception = engine.update_exception(id, patch, actor).await?;
                Ok(exception_rows(vec![exception]))
            }
            Command::DeleteException { id } => {
                access.can_delete_calendar_entry(&actor)?;
                engine.delete_exception(id, actor).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectExceptions { room_id } => {
                access.can_read(&actor)?;
                let mut exceptions = Vec::new();
                for room_id in self.rooms_in_scope(room_id).await {
                    exceptions.extend(engine.list_exceptions(room_id).await?);
                }
                Ok(exception_rows(exceptions))
            }

            // ── Reservations ─────────────────────────────────
            Command::InsertReservation { draft } => {
                access.can_create_reservation(&actor)?;
                let reservation = engine.create_reservation(draft, actor).await?;
                Ok(reservation_rows(vec![reservation]))
            }
            Command::UpdateReservation { code, patch } => {
                let current = engine
                    .get_reservation(&code, Visibility::IncludeCancelled)
                    .await?;
                access.can_modify_reservation(&actor, &current)?;
                let reservation = engine.update_reservation(&code, patch, actor).await?;
                Ok(reservation_rows(vec![reservation]))
            }
            Command::DeleteReservation { code } => {
                let current = engine
                    .get_reservation(&code, Visibility::IncludeCancelled)
                    .await?;
                access.can_modify_reservation(&actor, &current)?;
                engine.cancel_reservation(&code, actor).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { filter } => {
                access.can_read(&actor)?;
                Ok(reservation_rows(engine.list_reservations(&filter).await))
            }
            Command::SelectEffectiveHours { room_id, date } => {
                access.can_read(&actor)?;
                let hours = engine.effective_hours(room_id, date).await?;
                Ok(effective_hours_rows(room_id, date, hours))
            }
        }
    }

    /// One room, or every active room when unscoped.
    async fn rooms_in_scope(&self, room_id: Option<Ulid>) -> Vec<Ulid> {
        match room_id {
            Some(id) => vec![id],
            None => self.engine.list_rooms().await.into_iter().map(|r| r.id).collect(),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("department", Type::VARCHAR),
        field("created_by", Type::INT8),
    ]
}

fn hour_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("weekday", Type::INT4),
        field("opening", Type::VARCHAR),
        field("closing", Type::VARCHAR),
        field("max_duration", Type::INT8),
    ]
}

fn exception_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("reason", Type::VARCHAR),
        field("opening", Type::VARCHAR),
        field("closing", Type::VARCHAR),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("code", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("group_id", Type::INT8),
        field("link_id", Type::INT8),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("purpose", Type::VARCHAR),
        field("priority", Type::INT4),
        field("created_by", Type::INT8),
        field("updated_by", Type::INT8),
        field("cancelled_at", Type::VARCHAR),
        field("cancelled_by", Type::INT8),
        field("preempted_by", Type::VARCHAR),
    ]
}

fn effective_hours_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("opening", Type::VARCHAR),
        field("closing", Type::VARCHAR),
        field("max_duration", Type::INT8),
        field("special", Type::BOOL),
    ]
}

fn hhmm(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let encoded: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(encoded)))
}

fn room_rows(rooms: Vec<Room>) -> Response {
    rows(room_schema(), rooms, |e, r| {
        e.encode_field(&r.id.to_string())?;
        e.encode_field(&r.name)?;
        e.encode_field(&i64::from(r.capacity))?;
        e.encode_field(&r.department)?;
        e.encode_field(&r.created_by)
    })
}

fn hour_rows(hours: Vec<OperatingHour>) -> Response {
    rows(hour_schema(), hours, |e, h| {
        e.encode_field(&h.id.to_string())?;
        e.encode_field(&h.room_id.to_string())?;
        e.encode_field(&i32::from(h.weekday))?;
        e.encode_field(&hhmm(h.opening))?;
        e.encode_field(&hhmm(h.closing))?;
        e.encode_field(&h.max_duration_minutes.map(i64::from))
    })
}

fn exception_rows(exceptions: Vec<RoomException>) -> Response {
    rows(exception_schema(), exceptions, |e, x| {
        e.encode_field(&x.id.to_string())?;
        e.encode_field(&x.room_id.to_string())?;
        e.encode_field(&x.date.to_string())?;
        e.encode_field(&x.reason)?;
        e.encode_field(&x.opening.map(hhmm))?;
        e.encode_field(&x.closing.map(hhmm))
    })
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    rows(reservation_schema(), reservations, |e, r| {
        e.encode_field(&r.code)?;
        e.encode_field(&r.room_id.to_string())?;
        e.encode_field(&r.group_id)?;
        e.encode_field(&r.link_id)?;
        e.encode_field(&r.start.to_rfc3339())?;
        e.encode_field(&r.end.to_rfc3339())?;
        e.encode_field(&r.purpose)?;
        e.encode_field(&r.priority)?;
        e.encode_field(&r.created_by)?;
        e.encode_field(&r.updated_by)?;
        e.encode_field(&r.cancelled_at.map(|t| t.to_rfc3339()))?;
        e.encode_field(&r.cancelled_by)?;
        e.encode_field(&r.preempted_by)
    })
}

/// A closed day yields no rows.
fn effective_hours_rows(
    room_id: Ulid,
    date: chrono::NaiveDate,
    hours: Option<EffectiveHours>,
) -> Response {
    let items: Vec<(String, String, EffectiveHours)> = hours
        .into_iter()
        .map(|h| (room_id.to_string(), date.to_string(), h))
        .collect();
    rows(effective_hours_schema(), items, |e, (room, date, h)| {
        e.encode_field(room)?;
        e.encode_field(date)?;
        e.encode_field(&hhmm(h.opening))?;
        e.encode_field(&hhmm(h.closing))?;
        e.encode_field(&h.max_duration_minutes.map(i64::from))?;
        e.encode_field(&h.special)
    })
}

/// Row layout a statement produces, judged from its verb and table.
/// DELETE reports a row count only.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    if words.first() == Some(&"delete") {
        return vec![];
    }
    let table = words
        .iter()
        .position(|w| matches!(*w, "into" | "from" | "update"))
        .and_then(|i| words.get(i + 1));
    match table.copied() {
        Some("rooms") => room_schema(),
        Some("operating_hours") => hour_schema(),
        Some("exceptions") => exception_schema(),
        Some("reservations") => reservation_schema(),
        Some("effective_hours") => effective_hours_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomkeeperHandler {
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
        let actor = self.actor(client)?;
        Ok(vec![self.run(actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomkeeperQueryParser;

#[async_trait]
impl QueryParser for RoomkeeperQueryParser {
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
impl ExtendedQueryHandler for RoomkeeperHandler {
    type Statement = String;
    type QueryParser = RoomkeeperQueryParser;

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
        let actor = self.actor(client)?;
        let sql = substitute_params(portal);
        self.run(actor, &sql).await
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Walks backwards so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomkeeperFactory {
    handler: Arc<RoomkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<RoomkeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl RoomkeeperFactory {
    pub fn new(engine: Arc<Engine>, access: AccessPolicy, password: String) -> Self {
        let auth_source = RoomkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomkeeperHandler::new(engine, access)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomkeeperFactory {
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
    engine: Arc<Engine>,
    access: AccessPolicy,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RoomkeeperFactory::new(engine, access, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.kind().sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
