//! Guacamole daemon tunnel and the graphical session connector.
//!
//! The wire format is the Guacamole instruction stream: comma-separated
//! elements, each `<length>.<value>` with the length counting Unicode
//! characters, terminated by `;`. Instructions whose opcode is empty
//! (encoded prefix `0.`) are broker housekeeping and must never cross the
//! client boundary in either direction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Local, Utc};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access;
use crate::auth::Identity;
use crate::errors::ApiError;
use crate::session::channels::{HandshakeTx, SessionBus};
use crate::session::registry::offline_session;
use crate::session::{ServerResp, Session, SessionRecord, SessionStatus, SessionType};
use crate::state::AppState;
use crate::store::{Account, Asset, Gateway};

/// Encoded prefix of an instruction whose opcode is the empty string.
pub const INTERNAL_OPCODE_PREFIX: &[u8] = b"0.";

/// Largest single element the codec will accept.
const MAX_ELEMENT_LEN: usize = 1 << 20;

/// True for broker-internal instructions that must not be forwarded.
pub fn is_internal(frame: &[u8]) -> bool {
    frame.starts_with(INTERNAL_OPCODE_PREFIX)
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("guacd i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("guacd protocol: {0}")]
    Protocol(String),
}

impl From<TunnelError> for ApiError {
    fn from(e: TunnelError) -> Self {
        ApiError::connect_server(e.to_string())
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: &[&str]) -> Self {
        Self {
            opcode: opcode.into(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    /// Encode as `len.value,len.value,...;` with character-counted lengths.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        for (i, element) in std::iter::once(&self.opcode).chain(&self.args).enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&element.chars().count().to_string());
            out.push('.');
            out.push_str(element);
        }
        out.push(';');
        out.into_bytes()
    }

    /// Decode one full instruction.
    pub fn parse(frame: &[u8]) -> Result<Self, TunnelError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| TunnelError::Protocol("instruction is not UTF-8".into()))?;
        let mut elements = Vec::new();
        let mut rest = text;
        loop {
            let dot = rest
                .find('.')
                .ok_or_else(|| TunnelError::Protocol("missing length separator".into()))?;
            let len: usize = rest[..dot]
                .parse()
                .map_err(|_| TunnelError::Protocol(format!("bad length {:?}", &rest[..dot])))?;
            if len > MAX_ELEMENT_LEN {
                return Err(TunnelError::Protocol(format!("element too long: {len}")));
            }
            let value_start = dot + 1;
            let mut chars = rest[value_start..].char_indices();
            let value_end = match chars.nth(len) {
                Some((off, _)) => value_start + off,
                None if rest[value_start..].chars().count() == len => rest.len(),
                None => return Err(TunnelError::Protocol("element shorter than length".into())),
            };
            elements.push(rest[value_start..value_end].to_string());
            match rest[value_end..].chars().next() {
                Some(',') => rest = &rest[value_end + 1..],
                Some(';') => break,
                _ => return Err(TunnelError::Protocol("missing element terminator".into())),
            }
        }
        let mut it = elements.into_iter();
        Ok(Self {
            opcode: it.next().unwrap_or_default(),
            args: it.collect(),
        })
    }
}

/// What a tunnel needs to open or join a connection.
pub struct TunnelSpec {
    /// Empty for a new connection; a broker connection id to join one.
    pub connection_id: String,
    /// `rdp` or `vnc` (port already stripped).
    pub protocol: String,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// Connection parameters answered during the `args`/`connect` exchange.
    pub params: HashMap<String, String>,
}

/// An open guacd tunnel, handshake already completed.
pub struct Tunnel {
    reader: TunnelReader<OwnedReadHalf>,
    writer: TunnelWriter<OwnedWriteHalf>,
    /// Broker-assigned id; joining this id attaches an observer.
    pub connection_id: String,
    /// Gateway-assigned opaque session id.
    pub session_id: String,
}

pub struct TunnelReader<R> {
    reader: BufReader<R>,
}

pub struct TunnelWriter<W> {
    writer: W,
}

impl<R: tokio::io::AsyncRead + Unpin> TunnelReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read one complete raw instruction, `;` included.
    ///
    /// Elements are length-prefixed, so a `;` inside a value does not
    /// terminate the frame; the reader walks element boundaries.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, TunnelError> {
        let mut frame = Vec::new();
        loop {
            // length
            let mut len: usize = 0;
            loop {
                let b = self.reader.read_u8().await?;
                frame.push(b);
                match b {
                    b'0'..=b'9' => {
                        len = len * 10 + usize::from(b - b'0');
                        if len > MAX_ELEMENT_LEN {
                            return Err(TunnelError::Protocol("element too long".into()));
                        }
                    }
                    b'.' => break,
                    other => {
                        return Err(TunnelError::Protocol(format!(
                            "unexpected byte {other:#04x} in length"
                        )))
                    }
                }
            }
            // len characters
            for _ in 0..len {
                let first = self.reader.read_u8().await?;
                frame.push(first);
                let width = match first {
                    b if b < 0x80 => 0,
                    b if b >= 0xF0 => 3,
                    b if b >= 0xE0 => 2,
                    b if b >= 0xC0 => 1,
                    _ => return Err(TunnelError::Protocol("bad UTF-8 in element".into())),
                };
                for _ in 0..width {
                    frame.push(self.reader.read_u8().await?);
                }
            }
            // terminator
            let term = self.reader.read_u8().await?;
            frame.push(term);
            match term {
                b',' => continue,
                b';' => return Ok(frame),
                other => {
                    return Err(TunnelError::Protocol(format!(
                        "unexpected terminator {other:#04x}"
                    )))
                }
            }
        }
    }
}

impl<W: tokio::io::AsyncWrite + Unpin> TunnelWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { writer: inner }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TunnelError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_instruction(&mut self, ins: &Instruction) -> Result<(), TunnelError> {
        self.write_frame(&ins.encode()).await
    }
}

/// Run the broker handshake: `select`, answer `args`, send geometry and media
/// capabilities, `connect`, await `ready`. Returns the connection id.
async fn broker_handshake<R, W>(
    reader: &mut TunnelReader<R>,
    writer: &mut TunnelWriter<W>,
    spec: &TunnelSpec,
) -> Result<String, TunnelError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let select_target = if spec.connection_id.is_empty() {
        spec.protocol.as_str()
    } else {
        spec.connection_id.as_str()
    };
    writer
        .write_instruction(&Instruction::new("select", &[select_target]))
        .await?;

    let args = Instruction::parse(&reader.read_frame().await?)?;
    if args.opcode != "args" {
        return Err(TunnelError::Protocol(format!(
            "expected args, got {}",
            args.opcode
        )));
    }

    let (w, h, dpi) = (
        spec.width.to_string(),
        spec.height.to_string(),
        spec.dpi.to_string(),
    );
    writer
        .write_instruction(&Instruction::new(
            "size",
            &[w.as_str(), h.as_str(), dpi.as_str()],
        ))
        .await?;
    for capability in ["audio", "video", "image"] {
        writer
            .write_instruction(&Instruction::new(capability, &[]))
            .await?;
    }

    // Answer each requested parameter; the VERSION pseudo-arg is echoed,
    // anything unknown is left blank.
    let values: Vec<String> = args
        .args
        .iter()
        .map(|name| {
            if name.starts_with("VERSION") {
                name.clone()
            } else {
                spec.params.get(name).cloned().unwrap_or_default()
            }
        })
        .collect();
    let value_refs: Vec<&str> = values.iter().map(String::as_str).collect();
    writer
        .write_instruction(&Instruction::new("connect", &value_refs))
        .await?;

    let ready = Instruction::parse(&reader.read_frame().await?)?;
    if ready.opcode != "ready" {
        return Err(TunnelError::Protocol(format!(
            "expected ready, got {}",
            ready.opcode
        )));
    }
    Ok(ready.args.first().cloned().unwrap_or_default())
}

impl Tunnel {
    /// Open a tunnel to `addr` and complete the broker handshake.
    pub async fn connect(addr: &str, spec: &TunnelSpec) -> Result<Self, TunnelError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = TunnelReader::new(read_half);
        let mut writer = TunnelWriter::new(write_half);
        let connection_id = broker_handshake(&mut reader, &mut writer, spec).await?;
        Ok(Self {
            reader,
            writer,
            connection_id,
            session_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn split(self) -> (TunnelReader<OwnedReadHalf>, TunnelWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

fn default_port(protocol: &str) -> &'static str {
    if protocol == "vnc" {
        "5900"
    } else {
        "3389"
    }
}

/// Build the tunnel spec for a new connection to `asset` as `account`.
fn new_connection_spec(
    protocol: &str,
    geometry: (u32, u32, u32),
    asset: &Asset,
    account: &Account,
) -> TunnelSpec {
    let (proto, port) = match protocol.split_once(':') {
        Some((p, port)) => (p.to_string(), port.to_string()),
        None => (protocol.to_string(), default_port(protocol).to_string()),
    };
    let params = HashMap::from([
        ("hostname".to_string(), asset.ip.clone()),
        ("port".to_string(), port),
        ("username".to_string(), account.account.clone()),
        ("password".to_string(), account.password.clone()),
        ("ignore-cert".to_string(), "true".to_string()),
    ]);
    TunnelSpec {
        connection_id: String::new(),
        protocol: proto,
        width: geometry.0,
        height: geometry.1,
        dpi: geometry.2,
        params,
    }
}

/// Spec for joining an existing broker connection as an observer.
pub fn join_spec(connection_id: &str, geometry: (u32, u32, u32)) -> TunnelSpec {
    TunnelSpec {
        connection_id: connection_id.to_string(),
        protocol: String::new(),
        width: geometry.0,
        height: geometry.1,
        dpi: geometry.2,
        params: HashMap::new(),
    }
}

async fn establish(
    state: &AppState,
    who: &Identity,
    client_ip: &str,
    asset_id: i64,
    account_id: i64,
    protocol: &str,
    geometry: (u32, u32, u32),
) -> Result<(Tunnel, SessionRecord), ApiError> {
    let asset = state.db.asset(asset_id).await?;
    if !access::allowed(Local::now(), &asset.access_auth.0) {
        return Err(ApiError::connect_server("invalid access time"));
    }
    let account = state.db.account(account_id).await?;
    let gateway: Option<Gateway> = if asset.gateway_id != 0 {
        Some(state.db.gateway(asset.gateway_id).await?)
    } else {
        None
    };

    let addr = format!("{}:{}", state.config.guacd.host, state.config.guacd.port);
    let spec = new_connection_spec(protocol, geometry, &asset, &account);
    let tunnel = Tunnel::connect(&addr, &spec).await?;

    let record = SessionRecord {
        session_id: tunnel.session_id.clone(),
        session_type: SessionType::Web,
        protocol: protocol.to_string(),
        uid: who.uid,
        user_name: who.user_name.clone(),
        asset_id: asset.id,
        asset_info: asset.info(),
        account_id: account.id,
        account_info: account.info(),
        gateway_id: gateway.as_ref().map_or(0, |g| g.id),
        gateway_info: gateway.as_ref().map_or_else(String::new, Gateway::info),
        client_ip: client_ip.to_string(),
        status: SessionStatus::Online,
        connection_id: tunnel.connection_id.clone(),
        created_at: Utc::now(),
        closed_at: None,
    };
    Ok((tunnel, record))
}

/// Connector for a new graphical session. Spawned by the connect handler;
/// resolves `handshake`, then pumps until the tunnel, the bridge, or an admin
/// close ends the session.
#[allow(clippy::too_many_arguments)]
pub async fn run_session(
    state: AppState,
    who: Identity,
    client_ip: String,
    asset_id: i64,
    account_id: i64,
    protocol: String,
    geometry: (u32, u32, u32),
    bus: SessionBus,
    input: mpsc::Receiver<Vec<u8>>,
    handshake: HandshakeTx,
) {
    let (tunnel, record) = match establish(
        &state, &who, &client_ip, asset_id, account_id, &protocol, geometry,
    )
    .await
    {
        Ok(ok) => ok,
        Err(e) => {
            let _ = handshake.send(Err(e));
            return;
        }
    };

    let session_id = record.session_id.clone();
    let resp = ServerResp {
        code: 0,
        message: String::new(),
        session_id: session_id.clone(),
        uid: who.uid,
        user_name: who.user_name.clone(),
    };

    let session = Arc::new(Session::from_record(record));
    if let Err(e) = state.db.upsert_session(&*session.record.read().await).await {
        let _ = handshake.send(Err(e));
        return;
    }
    state.registry.store(&session_id, Arc::clone(&session));
    let _ = handshake.send(Ok(resp));

    if let Some(e) = pump(tunnel, &bus, input).await {
        let _ = bus.err.try_send(e);
    }

    // Teardown: the registry entry, the monitors and the durable record all
    // converge on OFFLINE.
    {
        let mut record = session.record.write().await;
        record.status = SessionStatus::Offline;
        record.closed_at = Some(Utc::now());
        if let Err(e) = state.db.upsert_session(&record).await {
            warn!(session_id, "offline upsert failed: {e}");
        }
    }
    offline_session(&state.registry, &state.catalog, &session_id, None).await;
    bus.close_away();
    debug!(session_id, "guacd session ended");
}

/// Connector for a monitor join on an existing connection. No session record
/// is created; the caller owns registration and teardown of the observer.
pub async fn run_monitor(
    state: AppState,
    connection_id: String,
    geometry: (u32, u32, u32),
    bus: SessionBus,
    input: mpsc::Receiver<Vec<u8>>,
    handshake: HandshakeTx,
) {
    let addr = format!("{}:{}", state.config.guacd.host, state.config.guacd.port);
    let spec = join_spec(&connection_id, geometry);
    let tunnel = match Tunnel::connect(&addr, &spec).await {
        Ok(t) => t,
        Err(e) => {
            let _ = handshake.send(Err(e.into()));
            return;
        }
    };
    let resp = ServerResp {
        session_id: tunnel.session_id.clone(),
        ..ServerResp::default()
    };
    let _ = handshake.send(Ok(resp));

    if let Some(e) = pump(tunnel, &bus, input).await {
        let _ = bus.err.try_send(e);
    }
    bus.close_away();
}

/// Bidirectional pump. Returns the fatal error, if any.
///
/// The reader runs as its own task so a blocked client write can never stall
/// tunnel reads; the writer loop runs here and owns the shutdown of both.
async fn pump(
    tunnel: Tunnel,
    bus: &SessionBus,
    mut input: mpsc::Receiver<Vec<u8>>,
) -> Option<ApiError> {
    let (mut rd, mut wr) = tunnel.split();

    let reader_bus = bus.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            match rd.read_frame().await {
                Ok(frame) => {
                    if frame.is_empty() || is_internal(&frame) {
                        continue;
                    }
                    if !reader_bus.send_output(frame).await {
                        return None;
                    }
                }
                Err(e) => return Some(ApiError::from(e)),
            }
        }
    });

    let result = loop {
        tokio::select! {
            joined = &mut reader => {
                return joined.unwrap_or(None);
            }
            _ = bus.away.cancelled() => break None,
            frame = input.recv() => match frame {
                Some(frame) => {
                    if is_internal(&frame) {
                        continue;
                    }
                    if let Err(e) = wr.write_frame(&frame).await {
                        break Some(ApiError::from(e));
                    }
                }
                None => break None,
            },
        }
    };
    reader.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_wire_format() {
        let ins = Instruction::new("select", &["rdp"]);
        assert_eq!(ins.encode(), b"6.select,3.rdp;");
        let empty_args = Instruction::new("audio", &[]);
        assert_eq!(empty_args.encode(), b"5.audio;");
    }

    #[test]
    fn parse_round_trips() {
        let ins = Instruction::new("size", &["1024", "768", "96"]);
        let back = Instruction::parse(&ins.encode()).unwrap();
        assert_eq!(back, ins);
    }

    #[test]
    fn lengths_count_characters_not_bytes() {
        let ins = Instruction::new("name", &["caf\u{e9}"]);
        let encoded = ins.encode();
        assert_eq!(encoded, "4.name,4.caf\u{e9};".as_bytes());
        assert_eq!(Instruction::parse(&encoded).unwrap(), ins);
    }

    #[test]
    fn semicolon_inside_value_does_not_terminate() {
        let ins = Instruction::new("blob", &["a;b,c"]);
        let back = Instruction::parse(&ins.encode()).unwrap();
        assert_eq!(back.args, vec!["a;b,c".to_string()]);
    }

    #[test]
    fn internal_prefix_is_the_empty_opcode() {
        let internal = Instruction::new("", &["ping"]);
        assert!(is_internal(&internal.encode()));
        assert!(!is_internal(&Instruction::new("sync", &["1"]).encode()));
    }

    #[test]
    fn parse_rejects_truncated_frames() {
        assert!(Instruction::parse(b"6.select").is_err());
        assert!(Instruction::parse(b"9.short;").is_err());
        assert!(Instruction::parse(b"x.select;").is_err());
    }

    #[tokio::test]
    async fn frame_reader_walks_element_boundaries() {
        let mut payload = Instruction::new("blob", &["a;b"]).encode();
        payload.extend_from_slice(&Instruction::new("sync", &["42"]).encode());
        let mut reader = TunnelReader::new(&payload[..]);

        let first = reader.read_frame().await.unwrap();
        assert_eq!(Instruction::parse(&first).unwrap().args, vec!["a;b"]);
        let second = reader.read_frame().await.unwrap();
        assert_eq!(Instruction::parse(&second).unwrap().opcode, "sync");
    }

    #[tokio::test]
    async fn broker_handshake_answers_requested_args() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_rd, our_wr) = tokio::io::split(ours);
        let (their_rd, their_wr) = tokio::io::split(theirs);

        // Scripted broker: expect select, offer args, expect the capability
        // burst and connect, then report ready.
        let broker = tokio::spawn(async move {
            let mut rd = TunnelReader::new(their_rd);
            let mut wr = TunnelWriter::new(their_wr);
            let select = Instruction::parse(&rd.read_frame().await.unwrap()).unwrap();
            assert_eq!(select.opcode, "select");
            assert_eq!(select.args, vec!["rdp"]);
            wr.write_instruction(&Instruction::new(
                "args",
                &["VERSION_1_5_0", "hostname", "port", "password"],
            ))
            .await
            .unwrap();
            let size = Instruction::parse(&rd.read_frame().await.unwrap()).unwrap();
            assert_eq!(size.args, vec!["1024", "768", "96"]);
            for expected in ["audio", "video", "image"] {
                let ins = Instruction::parse(&rd.read_frame().await.unwrap()).unwrap();
                assert_eq!(ins.opcode, expected);
            }
            let connect = Instruction::parse(&rd.read_frame().await.unwrap()).unwrap();
            assert_eq!(
                connect.args,
                vec!["VERSION_1_5_0", "10.0.0.1", "13389", "pw"]
            );
            wr.write_instruction(&Instruction::new("ready", &["$conn-1"]))
                .await
                .unwrap();
        });

        let spec = TunnelSpec {
            connection_id: String::new(),
            protocol: "rdp".into(),
            width: 1024,
            height: 768,
            dpi: 96,
            params: HashMap::from([
                ("hostname".to_string(), "10.0.0.1".to_string()),
                ("port".to_string(), "13389".to_string()),
                ("password".to_string(), "pw".to_string()),
            ]),
        };
        let mut reader = TunnelReader::new(our_rd);
        let mut writer = TunnelWriter::new(our_wr);
        let connection_id = broker_handshake(&mut reader, &mut writer, &spec)
            .await
            .unwrap();
        assert_eq!(connection_id, "$conn-1");
        broker.await.unwrap();
    }

    #[test]
    fn new_connection_spec_splits_protocol_port() {
        let asset = Asset {
            id: 1,
            name: "host-1".into(),
            ip: "10.0.0.1".into(),
            gateway_id: 0,
            access_auth: sqlx::types::Json(crate::access::AccessAuth::default()),
        };
        let account = Account {
            id: 1,
            name: "root".into(),
            account: "Administrator".into(),
            password: "pw".into(),
        };
        let spec = new_connection_spec("rdp:13389", (1024, 768, 96), &asset, &account);
        assert_eq!(spec.protocol, "rdp");
        assert_eq!(spec.params["port"], "13389");
        assert_eq!(spec.params["hostname"], "10.0.0.1");

        let spec = new_connection_spec("vnc", (800, 600, 96), &asset, &account);
        assert_eq!(spec.params["port"], "5900");
    }
}
