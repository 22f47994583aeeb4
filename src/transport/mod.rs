pub mod raw;
pub mod throttle;
pub mod ws;

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::protocol::frame::{Frame, MessageType};

/// A bidirectional byte stream produced by a [Dialer]. Both transports run on
///  top of this, which is what lets the traffic-shaping decorator slide in
///  underneath either of them.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Conn for T {}

/// This trait decouples establishing a TCP connection from what runs on top
///  of it. Decorators (e.g. [throttle::ThrottledDialer]) wrap another dialer.
#[async_trait]
pub trait Dialer: Sync + Send {
    async fn dial(&self, address: &str) -> anyhow::Result<Box<dyn Conn>>;
}

pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> TcpDialer {
        TcpDialer {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> anyhow::Result<Box<dyn Conn>> {
        let conn = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", address))??;
        Ok(Box::new(conn))
    }
}

/// Observes every NDT5 frame read from or written to a control channel. The
///  observer must not modify frames, but it may log them or forward them as
///  debug events.
#[async_trait]
pub trait FrameObserver: Send + Sync {
    async fn on_read(&mut self, frame: &Frame);
    async fn on_write(&mut self, frame: &Frame);
}

pub struct NoopFrameObserver;

#[async_trait]
impl FrameObserver for NoopFrameObserver {
    async fn on_read(&mut self, _frame: &Frame) {}
    async fn on_write(&mut self, _frame: &Frame) {}
}

/// The control connection of an NDT5 session. Implementations differ in
///  framing (raw bytes vs. one WebSocket message per frame), in the shape of
///  the login message and in whether a kickoff is actually on the wire.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn set_frame_observer(&mut self, observer: Box<dyn FrameObserver>);

    /// Applies to every subsequent read and write on this channel.
    fn set_deadline(&mut self, deadline: Instant);

    /// Writes the login message in the convention of the transport.
    async fn write_login(&mut self, version_compat: &str, test_suite: u8) -> anyhow::Result<()>;

    /// Reads the kickoff message into `buf`. Transports without an on-wire
    ///  kickoff synthesize it locally and do not touch the network.
    async fn read_kickoff(&mut self, buf: &mut [u8]) -> anyhow::Result<()>;

    async fn read_frame(&mut self) -> anyhow::Result<Frame>;

    async fn write_message(&mut self, mtype: MessageType, data: &[u8]) -> anyhow::Result<()>;

    async fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// The auxiliary connection used only to pump bytes for throughput
///  measurement.
#[async_trait]
pub trait MeasurementChannel: Send {
    fn set_deadline(&mut self, deadline: Instant);

    /// Configures the buffer used by [read_discard](Self::read_discard). Must
    ///  be called before the first read; transports that do their own
    ///  buffering may treat this as a no-op.
    fn alloc_read_buffer(&mut self, size: usize);

    /// Reads and discards bytes, returning how many. A return value of 0
    ///  means the peer closed the connection in an orderly fashion.
    async fn read_discard(&mut self) -> anyhow::Result<u64>;

    /// Sets the message sent by
    ///  [write_prepared_message](Self::write_prepared_message). Must be
    ///  called before the first write.
    fn set_prepared_message(&mut self, body: &[u8]);

    /// Writes the previously prepared message, returning the number of bytes
    ///  written.
    async fn write_prepared_message(&mut self) -> anyhow::Result<u64>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Creates the two kinds of NDT5 connections. There is one implementation per
///  transport, and the factory is the client's injection point for choosing
///  between them (or substituting mocks).
#[async_trait]
pub trait TransportFactory: Sync + Send {
    /// Dials a control connection. If `address` lacks a port, the transport's
    ///  default control port is used.
    async fn dial_control(
        &self,
        address: &str,
        user_agent: &str,
    ) -> anyhow::Result<Box<dyn ControlChannel>>;

    /// Dials a measurement connection to `address`, which the caller composes
    ///  from the server host and the port announced in TEST_PREPARE.
    async fn dial_measurement(
        &self,
        address: &str,
        user_agent: &str,
    ) -> anyhow::Result<Box<dyn MeasurementChannel>>;
}

/// Runs `fut`, aborting when `deadline` (if any) passes.
pub(crate) async fn io_deadline<T>(
    deadline: Option<Instant>,
    what: &str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => bail!("{} timed out", what),
        },
        None => fut.await,
    }
}

/// Appends `default_port` unless the address already carries a port. NDT5
///  addresses are host names or IPv4 literals, so the presence of a colon is
///  what decides.
pub(crate) fn with_default_port(address: &str, default_port: u16) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, default_port)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::bare_host("ndt.example.org", 3001, "ndt.example.org:3001")]
    #[case::with_port("ndt.example.org:1234", 3001, "ndt.example.org:1234")]
    #[case::ipv4("192.0.2.1", 3010, "192.0.2.1:3010")]
    fn test_with_default_port(#[case] address: &str, #[case] port: u16, #[case] expected: &str) {
        assert_eq!(with_default_port(address, port), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_deadline_expires() {
        let deadline = Instant::now() + Duration::from_millis(100);
        let result: anyhow::Result<()> = io_deadline(Some(deadline), "slow read", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("slow read timed out"));
    }

    #[tokio::test]
    async fn test_io_deadline_absent() {
        let result = io_deadline(None, "read", async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
    }
}
