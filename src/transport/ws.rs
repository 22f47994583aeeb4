use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::protocol::frame::{Frame, MessageType, HEADER_SIZE, MAX_FRAME_SIZE};
use crate::transport::{
    io_deadline, with_default_port, Conn, ControlChannel, Dialer, FrameObserver,
    MeasurementChannel, NoopFrameObserver, TransportFactory,
};

/// Control port of the wss NDT deployment.
pub const DEFAULT_CONTROL_PORT: u16 = 3010;

const WS_PATH: &str = "/ndt_protocol";
const WS_SUBPROTOCOL: &str = "ndt";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const BUFFER_SIZE: usize = 1 << 20;

type WsConn = WebSocketStream<MaybeTlsStream<Box<dyn Conn>>>;

/// The transport that tunnels NDT5 frames through TLS WebSocket messages:
///  each binary message carries exactly one frame, whose body is JSON. Login
///  uses EXTENDED_LOGIN and the kickoff is synthesized locally because the
///  wss server never sends one.
pub struct WsTransport {
    dialer: Arc<dyn Dialer>,
}

impl WsTransport {
    pub fn new(dialer: Arc<dyn Dialer>) -> WsTransport {
        WsTransport { dialer }
    }

    async fn handshake(&self, address: &str, user_agent: &str) -> anyhow::Result<WsConn> {
        let url = format!("wss://{}{}", address, WS_PATH);
        debug!("dialing websocket connection to {}", url);

        let mut request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("building websocket request for {}", url))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(WS_SUBPROTOCOL),
        );
        request
            .headers_mut()
            .insert("User-Agent", HeaderValue::from_str(user_agent)?);

        let mut config = WebSocketConfig::default();
        config.write_buffer_size = BUFFER_SIZE;
        config.max_write_buffer_size = 2 * BUFFER_SIZE;

        let conn = self.dialer.dial(address).await?;
        let (ws, _response) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            client_async_tls_with_config(request, conn, Some(config), None),
        )
        .await
        .map_err(|_| anyhow!("websocket handshake with {} timed out", address))?
        .with_context(|| format!("websocket handshake with {}", address))?;
        Ok(ws)
    }
}

#[async_trait]
impl TransportFactory for WsTransport {
    async fn dial_control(
        &self,
        address: &str,
        user_agent: &str,
    ) -> anyhow::Result<Box<dyn ControlChannel>> {
        let address = with_default_port(address, DEFAULT_CONTROL_PORT);
        let ws = self.handshake(&address, user_agent).await?;
        Ok(Box::new(WsControlChannel {
            ws,
            deadline: None,
            observer: Box::new(NoopFrameObserver),
        }))
    }

    async fn dial_measurement(
        &self,
        address: &str,
        user_agent: &str,
    ) -> anyhow::Result<Box<dyn MeasurementChannel>> {
        let ws = self.handshake(address, user_agent).await?;
        Ok(Box::new(WsMeasurementChannel {
            ws,
            deadline: None,
            prepared: Bytes::new(),
        }))
    }
}

#[derive(Serialize)]
struct WsLoginBody<'a> {
    msg: &'a str,
    tests: String,
}

#[derive(Serialize)]
struct WsTextBody<'a> {
    msg: &'a str,
}

/// Server TEST_MSG bodies over wss are JSON. Most carry just `msg`; the
///  in-test throughput reports instead carry the three upper-case fields,
///  which a raw-transport server would have sent as one space-separated line.
#[derive(Deserialize)]
struct WsServerBody {
    #[serde(default)]
    msg: String,
    #[serde(default, rename = "ThroughputValue")]
    throughput_value: String,
    #[serde(default, rename = "UnsentDataAmount")]
    unsent_data_amount: String,
    #[serde(default, rename = "TotalSentByte")]
    total_sent_byte: String,
}

/// Decodes one WebSocket payload into a frame, reconstructing the textual
///  message a raw-transport server would have sent. The raw bytes are kept
///  unchanged so observers still see the JSON.
fn frame_from_ws_payload(data: Vec<u8>) -> anyhow::Result<Frame> {
    if data.len() < HEADER_SIZE {
        bail!("websocket frame too small: {} bytes", data.len());
    }
    if data.len() > MAX_FRAME_SIZE {
        bail!("websocket frame too large: {} bytes", data.len());
    }
    let length = u16::from_be_bytes([data[1], data[2]]) as usize;
    if HEADER_SIZE + length != data.len() {
        bail!(
            "websocket message does not contain a complete ndt5 frame: header says {} body bytes, got {}",
            length,
            data.len() - HEADER_SIZE
        );
    }
    let body: WsServerBody =
        serde_json::from_slice(&data[HEADER_SIZE..]).context("parsing frame body JSON")?;
    let message = if !body.throughput_value.is_empty()
        && !body.unsent_data_amount.is_empty()
        && !body.total_sent_byte.is_empty()
    {
        format!(
            "{} {} {}",
            body.throughput_value, body.unsent_data_amount, body.total_sent_byte
        )
    } else {
        body.msg
    };
    let raw = Bytes::from(data);
    Ok(Frame {
        mtype: MessageType::from(raw[0]),
        message: Bytes::from(message),
        raw,
    })
}

/// Reads the next data message, transparently skipping ping/pong.
async fn next_binary(ws: &mut WsConn) -> anyhow::Result<Option<Vec<u8>>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(other)) => bail!("expected a binary websocket message, got {:?}", other),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

struct WsControlChannel {
    ws: WsConn,
    deadline: Option<Instant>,
    observer: Box<dyn FrameObserver>,
}

impl WsControlChannel {
    async fn write_json_message(
        &mut self,
        mtype: MessageType,
        body: &impl Serialize,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_vec(body).context("serializing frame body")?;
        let frame = Frame::new(mtype, &body)?;
        self.write_frame(&frame).await
    }
}

#[async_trait]
impl ControlChannel for WsControlChannel {
    fn set_frame_observer(&mut self, observer: Box<dyn FrameObserver>) {
        self.observer = observer;
    }

    fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    async fn write_login(&mut self, version_compat: &str, test_suite: u8) -> anyhow::Result<()> {
        self.write_json_message(
            MessageType::ExtendedLogin,
            &WsLoginBody {
                msg: version_compat,
                tests: test_suite.to_string(),
            },
        )
        .await
    }

    async fn read_kickoff(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        // There is no kickoff on the wire with WebSocket; pretend we read one.
        let sentinel = crate::protocol::control::KICKOFF_MESSAGE;
        let n = buf.len().min(sentinel.len());
        buf[..n].copy_from_slice(&sentinel[..n]);
        Ok(())
    }

    async fn read_frame(&mut self) -> anyhow::Result<Frame> {
        let deadline = self.deadline;
        let ws = &mut self.ws;
        let frame = io_deadline(deadline, "frame read", async {
            match next_binary(ws).await? {
                Some(data) => frame_from_ws_payload(data),
                None => bail!("websocket closed while reading a frame"),
            }
        })
        .await?;
        self.observer.on_read(&frame).await;
        Ok(frame)
    }

    async fn write_message(&mut self, mtype: MessageType, data: &[u8]) -> anyhow::Result<()> {
        let body = String::from_utf8_lossy(data).into_owned();
        self.write_json_message(mtype, &WsTextBody { msg: &body }).await
    }

    async fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.observer.on_write(frame).await;
        let deadline = self.deadline;
        let ws = &mut self.ws;
        let message = Message::binary(frame.raw.to_vec());
        io_deadline(deadline, "frame write", async {
            ws.send(message).await.context("writing frame")?;
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e).context("closing control connection"),
        }
    }
}

struct WsMeasurementChannel {
    ws: WsConn,
    deadline: Option<Instant>,
    prepared: Bytes,
}

#[async_trait]
impl MeasurementChannel for WsMeasurementChannel {
    fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    fn alloc_read_buffer(&mut self, _size: usize) {
        // WebSocket reads are whole messages; nothing to preallocate.
    }

    async fn read_discard(&mut self) -> anyhow::Result<u64> {
        let deadline = self.deadline;
        let ws = &mut self.ws;
        io_deadline(deadline, "measurement read", async {
            match next_binary(ws).await? {
                Some(data) => Ok(data.len() as u64),
                None => Ok(0),
            }
        })
        .await
    }

    fn set_prepared_message(&mut self, body: &[u8]) {
        self.prepared = Bytes::copy_from_slice(body);
    }

    async fn write_prepared_message(&mut self) -> anyhow::Result<u64> {
        anyhow::ensure!(!self.prepared.is_empty(), "prepared message not configured");
        let deadline = self.deadline;
        let ws = &mut self.ws;
        let message = Message::binary(self.prepared.to_vec());
        let count = self.prepared.len() as u64;
        io_deadline(deadline, "measurement write", async {
            ws.send(message).await.context("measurement write")?;
            Ok(count)
        })
        .await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e).context("closing measurement connection"),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn ws_payload(mtype: u8, body: &str) -> Vec<u8> {
        let mut data = vec![mtype];
        data.extend_from_slice(&(body.len() as u16).to_be_bytes());
        data.extend_from_slice(body.as_bytes());
        data
    }

    #[rstest]
    #[case::msg_field(r#"{"msg":"v3.7.0"}"#, "v3.7.0")]
    #[case::empty_msg(r#"{}"#, "")]
    #[case::throughput_triple(
        r#"{"msg":"","ThroughputValue":"1000","UnsentDataAmount":"0","TotalSentByte":"12345"}"#,
        "1000 0 12345"
    )]
    #[case::partial_triple_falls_back(
        r#"{"msg":"fallback","ThroughputValue":"1000","UnsentDataAmount":"","TotalSentByte":"1"}"#,
        "fallback"
    )]
    fn test_frame_from_ws_payload_message(#[case] body: &str, #[case] expected: &str) {
        let data = ws_payload(5, body);
        let frame = frame_from_ws_payload(data.clone()).unwrap();
        assert_eq!(frame.mtype, MessageType::TestMsg);
        assert_eq!(frame.message_str(), expected);
        // raw JSON is preserved for observability
        assert_eq!(&frame.raw[..], &data[..]);
    }

    #[rstest]
    #[case::too_small(vec![5u8, 0])]
    #[case::length_mismatch(ws_payload(5, r#"{"msg":"a"}"#)[..10].to_vec())]
    #[case::not_json(ws_payload(5, "plain text"))]
    fn test_frame_from_ws_payload_rejects(#[case] data: Vec<u8>) {
        assert!(frame_from_ws_payload(data).is_err());
    }

    #[rstest]
    fn test_login_body_shape() {
        let body = serde_json::to_string(&WsLoginBody {
            msg: "v3.7.0",
            tests: 22.to_string(),
        })
        .unwrap();
        assert_eq!(body, r#"{"msg":"v3.7.0","tests":"22"}"#);
    }
}
