use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::frame::{Frame, MessageType, HEADER_SIZE};
use crate::transport::{
    io_deadline, with_default_port, Conn, ControlChannel, Dialer, FrameObserver,
    MeasurementChannel, NoopFrameObserver, TransportFactory,
};

/// Control port of the original raw-TCP NDT deployment.
pub const DEFAULT_CONTROL_PORT: u16 = 3001;

/// The transport that speaks NDT5 frames directly over a cleartext TCP
///  connection, as the original NDT codebase did. The login body is the bare
///  suite byte and the kickoff sentinel really is on the wire.
pub struct RawTransport {
    dialer: Arc<dyn Dialer>,
}

impl RawTransport {
    pub fn new(dialer: Arc<dyn Dialer>) -> RawTransport {
        RawTransport { dialer }
    }
}

#[async_trait]
impl TransportFactory for RawTransport {
    async fn dial_control(
        &self,
        address: &str,
        _user_agent: &str,
    ) -> anyhow::Result<Box<dyn ControlChannel>> {
        let address = with_default_port(address, DEFAULT_CONTROL_PORT);
        debug!("dialing raw control connection to {}", address);
        let conn = self.dialer.dial(&address).await?;
        Ok(Box::new(RawControlChannel {
            conn,
            deadline: None,
            observer: Box::new(NoopFrameObserver),
        }))
    }

    async fn dial_measurement(
        &self,
        address: &str,
        _user_agent: &str,
    ) -> anyhow::Result<Box<dyn MeasurementChannel>> {
        debug!("dialing raw measurement connection to {}", address);
        let conn = self.dialer.dial(address).await?;
        Ok(Box::new(RawMeasurementChannel {
            conn,
            deadline: None,
            read_buf: Vec::new(),
            prepared: Bytes::new(),
        }))
    }
}

struct RawControlChannel {
    conn: Box<dyn Conn>,
    deadline: Option<Instant>,
    observer: Box<dyn FrameObserver>,
}

#[async_trait]
impl ControlChannel for RawControlChannel {
    fn set_frame_observer(&mut self, observer: Box<dyn FrameObserver>) {
        self.observer = observer;
    }

    fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    async fn write_login(&mut self, _version_compat: &str, test_suite: u8) -> anyhow::Result<()> {
        // The legacy login carries only the suite byte; the compat version is
        //  a WebSocket-transport concept.
        self.write_message(MessageType::Login, &[test_suite]).await
    }

    async fn read_kickoff(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let deadline = self.deadline;
        io_deadline(deadline, "kickoff read", async {
            self.conn
                .read_exact(buf)
                .await
                .context("reading kickoff message")?;
            Ok(())
        })
        .await
    }

    async fn read_frame(&mut self) -> anyhow::Result<Frame> {
        let deadline = self.deadline;
        let frame = io_deadline(deadline, "frame read", async {
            let mut header = [0u8; HEADER_SIZE];
            self.conn
                .read_exact(&mut header)
                .await
                .context("reading frame header")?;
            let length = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut raw = BytesMut::with_capacity(HEADER_SIZE + length);
            raw.extend_from_slice(&header);
            raw.resize(HEADER_SIZE + length, 0);
            self.conn
                .read_exact(&mut raw[HEADER_SIZE..])
                .await
                .context("reading frame body")?;
            Frame::from_wire(raw.freeze())
        })
        .await?;
        self.observer.on_read(&frame).await;
        Ok(frame)
    }

    async fn write_message(&mut self, mtype: MessageType, data: &[u8]) -> anyhow::Result<()> {
        let frame = Frame::new(mtype, data)?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.observer.on_write(frame).await;
        let deadline = self.deadline;
        let raw = frame.raw.clone();
        io_deadline(deadline, "frame write", async {
            self.conn
                .write_all(&raw)
                .await
                .context("writing frame")?;
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.conn.shutdown().await.context("closing control connection")
    }
}

struct RawMeasurementChannel {
    conn: Box<dyn Conn>,
    deadline: Option<Instant>,
    read_buf: Vec<u8>,
    prepared: Bytes,
}

#[async_trait]
impl MeasurementChannel for RawMeasurementChannel {
    fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    fn alloc_read_buffer(&mut self, size: usize) {
        self.read_buf = vec![0u8; size];
    }

    async fn read_discard(&mut self) -> anyhow::Result<u64> {
        anyhow::ensure!(!self.read_buf.is_empty(), "read buffer not configured");
        let deadline = self.deadline;
        let buf = &mut self.read_buf;
        let conn = &mut self.conn;
        io_deadline(deadline, "measurement read", async {
            let count = conn.read(buf).await.context("measurement read")?;
            Ok(count as u64)
        })
        .await
    }

    fn set_prepared_message(&mut self, body: &[u8]) {
        self.prepared = Bytes::copy_from_slice(body);
    }

    async fn write_prepared_message(&mut self) -> anyhow::Result<u64> {
        anyhow::ensure!(!self.prepared.is_empty(), "prepared message not configured");
        let deadline = self.deadline;
        let prepared = self.prepared.clone();
        let conn = &mut self.conn;
        io_deadline(deadline, "measurement write", async {
            conn.write_all(&prepared).await.context("measurement write")?;
            Ok(prepared.len() as u64)
        })
        .await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.conn.shutdown().await.context("closing measurement connection")
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::io::duplex;

    use crate::protocol::error::ProtocolError;

    use super::*;

    fn control_over(conn: impl Conn + 'static) -> RawControlChannel {
        RawControlChannel {
            conn: Box::new(conn),
            deadline: None,
            observer: Box::new(NoopFrameObserver),
        }
    }

    #[tokio::test]
    async fn test_read_frame_from_wire_bytes() {
        let (client, mut server) = duplex(1024);
        let mut channel = control_over(client);
        server.write_all(b"\x05\x00\x05hello").await.unwrap();
        let frame = channel.read_frame().await.unwrap();
        assert_eq!(frame.mtype, MessageType::TestMsg);
        assert_eq!(&frame.message[..], b"hello");
        assert_eq!(&frame.raw[..], b"\x05\x00\x05hello");
    }

    #[tokio::test]
    async fn test_read_frame_short_read_fails() {
        let (client, mut server) = duplex(1024);
        let mut channel = control_over(client);
        server.write_all(b"\x05\x00\x05he").await.unwrap();
        drop(server);
        assert!(channel.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_write_login_is_suite_byte_frame() {
        let (client, mut server) = duplex(1024);
        let mut channel = control_over(client);
        channel.write_login("v3.7.0", 0x16).await.unwrap();
        let mut written = [0u8; 4];
        server.read_exact(&mut written).await.unwrap();
        assert_eq!(&written, b"\x02\x00\x01\x16");
    }

    #[tokio::test]
    async fn test_write_message_rejects_oversize() {
        let (client, _server) = duplex(64);
        let mut channel = control_over(client);
        let body = vec![b'x'; 65536];
        let err = channel
            .write_message(MessageType::TestMsg, &body)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::MessageTooLarge)
        );
    }

    #[tokio::test]
    async fn test_read_kickoff_reads_exactly_13_bytes() {
        let (client, mut server) = duplex(1024);
        let mut channel = control_over(client);
        server.write_all(b"123456 654321\x01\x00\x010").await.unwrap();
        let mut kickoff = [0u8; 13];
        channel.read_kickoff(&mut kickoff).await.unwrap();
        assert_eq!(&kickoff, b"123456 654321");
        // the next frame is still intact after the kickoff
        let frame = channel.read_frame().await.unwrap();
        assert_eq!(frame.mtype, MessageType::SrvQueue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_deadline() {
        let (client, _server) = duplex(1024);
        let mut channel = control_over(client);
        channel.set_deadline(Instant::now() + Duration::from_secs(1));
        let err = channel.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_measurement_read_requires_buffer() {
        let (client, _server) = duplex(1024);
        let mut channel = RawMeasurementChannel {
            conn: Box::new(client),
            deadline: None,
            read_buf: Vec::new(),
            prepared: Bytes::new(),
        };
        assert!(channel.read_discard().await.is_err());
    }

    #[tokio::test]
    async fn test_measurement_read_and_eof() {
        let (client, mut server) = duplex(1024);
        let mut channel = RawMeasurementChannel {
            conn: Box::new(client),
            deadline: None,
            read_buf: Vec::new(),
            prepared: Bytes::new(),
        };
        channel.alloc_read_buffer(1 << 10);
        server.write_all(&[0u8; 100]).await.unwrap();
        drop(server);
        assert_eq!(channel.read_discard().await.unwrap(), 100);
        assert_eq!(channel.read_discard().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_measurement_write_prepared() {
        let (client, mut server) = duplex(1024);
        let mut channel = RawMeasurementChannel {
            conn: Box::new(client),
            deadline: None,
            read_buf: Vec::new(),
            prepared: Bytes::new(),
        };
        channel.set_prepared_message(b"abcd");
        assert_eq!(channel.write_prepared_message().await.unwrap(), 4);
        let mut received = [0u8; 4];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"abcd");
    }
}
