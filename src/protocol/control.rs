use anyhow::{anyhow, Context};
use bytes::Bytes;

use crate::protocol::error::ProtocolError;
use crate::protocol::frame::MessageType;
use crate::transport::ControlChannel;

/// Sub-tests a client may request, as bits of the login suite byte.
pub const TEST_UPLOAD: u8 = 1 << 1;
pub const TEST_DOWNLOAD: u8 = 1 << 2;
pub const TEST_STATUS: u8 = 1 << 4;

/// Protocol version the client announces. Servers gate features on this, so
///  it stays pinned to the last NDT release line rather than tracking the
///  crate version.
pub const NDT5_VERSION_COMPAT: &str = "v3.7.0";

/// Sentinel the server writes on the control socket after accepting a login.
///  Transports without an on-wire kickoff synthesize these exact bytes.
pub const KICKOFF_MESSAGE: &[u8] = b"123456 654321";

/// The sequence-sensitive steps of the NDT5 control protocol, run over one
///  control channel. Every step reads or writes exactly the frames that step
///  allows; anything else is [ProtocolError::UnexpectedMessage] wrapped with
///  the step name.
///
/// The linear session order is: [send_login](Self::send_login) →
///  [receive_kickoff](Self::receive_kickoff) →
///  [wait_in_queue](Self::wait_in_queue) →
///  [receive_version](Self::receive_version) →
///  [receive_test_ids](Self::receive_test_ids) → per-test sub-protocols →
///  results / logout loop.
pub struct ControlProtocol {
    channel: Box<dyn ControlChannel>,
}

impl ControlProtocol {
    pub fn new(channel: Box<dyn ControlChannel>) -> ControlProtocol {
        ControlProtocol { channel }
    }

    pub async fn send_login(&mut self) -> anyhow::Result<()> {
        let suite = TEST_UPLOAD | TEST_DOWNLOAD | TEST_STATUS;
        self.channel
            .write_login(NDT5_VERSION_COMPAT, suite)
            .await
            .context("send_login")
    }

    pub async fn receive_kickoff(&mut self) -> anyhow::Result<()> {
        let mut received = [0u8; KICKOFF_MESSAGE.len()];
        self.channel
            .read_kickoff(&mut received)
            .await
            .context("receive_kickoff")?;
        if &received[..] != KICKOFF_MESSAGE {
            return Err(anyhow!(ProtocolError::InvalidKickoff).context("receive_kickoff"));
        }
        Ok(())
    }

    pub async fn wait_in_queue(&mut self) -> anyhow::Result<()> {
        let frame = self.channel.read_frame().await.context("wait_in_queue")?;
        if frame.mtype != MessageType::SrvQueue {
            return Err(anyhow!(ProtocolError::UnexpectedMessage).context("wait_in_queue"));
        }
        if &frame.message[..] != b"0" {
            // Like libndt, we choose not to actually wait in the queue
            return Err(anyhow!(ProtocolError::ServerBusy).context("wait_in_queue"));
        }
        Ok(())
    }

    pub async fn receive_version(&mut self) -> anyhow::Result<String> {
        let frame = self.channel.read_frame().await.context("receive_version")?;
        if frame.mtype != MessageType::Login {
            return Err(anyhow!(ProtocolError::UnexpectedMessage).context("receive_version"));
        }
        Ok(frame.message_str())
    }

    /// Receives the server's test plan: space-separated decimal test IDs. An
    ///  empty body is a valid empty plan (happens when only the status test
    ///  was granted).
    pub async fn receive_test_ids(&mut self) -> anyhow::Result<Vec<u8>> {
        let frame = self
            .channel
            .read_frame()
            .await
            .context("receive_test_ids")?;
        if frame.mtype != MessageType::Login {
            return Err(anyhow!(ProtocolError::UnexpectedMessage).context("receive_test_ids"));
        }
        if frame.message.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for elem in frame.message_str().split(' ') {
            let id: u8 = elem
                .parse()
                .with_context(|| format!("receive_test_ids: bad test id {:?}", elem))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Receives TEST_PREPARE; the body is the measurement port as ASCII
    ///  decimal.
    pub async fn expect_test_prepare(&mut self) -> anyhow::Result<String> {
        let frame = self
            .channel
            .read_frame()
            .await
            .context("expect_test_prepare")?;
        if frame.mtype != MessageType::TestPrepare {
            return Err(anyhow!(ProtocolError::UnexpectedMessage).context("expect_test_prepare"));
        }
        Ok(frame.message_str())
    }

    pub async fn expect_test_start(&mut self) -> anyhow::Result<()> {
        let frame = self
            .channel
            .read_frame()
            .await
            .context("expect_test_start")?;
        if frame.mtype != MessageType::TestStart {
            return Err(anyhow!(ProtocolError::UnexpectedMessage).context("expect_test_start"));
        }
        Ok(())
    }

    pub async fn expect_test_msg(&mut self) -> anyhow::Result<String> {
        let frame = self.channel.read_frame().await.context("expect_test_msg")?;
        if frame.mtype != MessageType::TestMsg {
            return Err(anyhow!(ProtocolError::UnexpectedMessage).context("expect_test_msg"));
        }
        if frame.message.is_empty() {
            return Err(anyhow!(ProtocolError::ExpectedNonEmptyMessage).context("expect_test_msg"));
        }
        Ok(frame.message_str())
    }

    pub async fn expect_test_finalize(&mut self) -> anyhow::Result<()> {
        let frame = self
            .channel
            .read_frame()
            .await
            .context("expect_test_finalize")?;
        if frame.mtype != MessageType::TestFinalize {
            return Err(anyhow!(ProtocolError::UnexpectedMessage).context("expect_test_finalize"));
        }
        Ok(())
    }

    pub async fn send_test_msg(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.channel
            .write_message(MessageType::TestMsg, data)
            .await
            .context("send_test_msg")
    }

    /// One iteration of the download results loop: the next frame must be
    ///  either TEST_FINALIZE (end of test) or a TEST_MSG carrying a web100
    ///  line.
    pub async fn receive_test_finalize_or_test_msg(
        &mut self,
    ) -> anyhow::Result<(MessageType, Bytes)> {
        let frame = self
            .channel
            .read_frame()
            .await
            .context("receive_test_finalize_or_test_msg")?;
        match frame.mtype {
            MessageType::TestFinalize | MessageType::TestMsg => Ok((frame.mtype, frame.message)),
            _ => Err(
                anyhow!(ProtocolError::UnexpectedMessage).context("receive_test_finalize_or_test_msg"),
            ),
        }
    }

    /// One iteration of the session results loop: the next frame must be
    ///  either LOGOUT (end of session) or a RESULTS record.
    pub async fn receive_logout_or_results(&mut self) -> anyhow::Result<(MessageType, Bytes)> {
        let frame = self
            .channel
            .read_frame()
            .await
            .context("receive_logout_or_results")?;
        match frame.mtype {
            MessageType::Logout | MessageType::Results => Ok((frame.mtype, frame.message)),
            _ => Err(anyhow!(ProtocolError::UnexpectedMessage).context("receive_logout_or_results")),
        }
    }

    pub fn set_frame_observer(&mut self, observer: Box<dyn crate::transport::FrameObserver>) {
        self.channel.set_frame_observer(observer);
    }

    pub fn set_deadline(&mut self, deadline: tokio::time::Instant) {
        self.channel.set_deadline(deadline);
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.channel.close().await
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::protocol::frame::Frame;
    use crate::test_util::{ScriptedControlChannel, ScriptedRead};

    use super::*;

    fn proto_with_script(kickoff: &[u8], script: Vec<ScriptedRead>) -> ControlProtocol {
        let (channel, _written) = ScriptedControlChannel::new(kickoff, script);
        ControlProtocol::new(Box::new(channel))
    }

    fn frame(mtype: MessageType, body: &[u8]) -> ScriptedRead {
        ScriptedRead::Frame(Frame::new(mtype, body).unwrap())
    }

    #[tokio::test]
    async fn test_receive_kickoff_ok() {
        let mut proto = proto_with_script(KICKOFF_MESSAGE, Vec::new());
        proto.receive_kickoff().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_kickoff_wrong_bytes() {
        let mut proto = proto_with_script(b"654321 123456", Vec::new());
        let err = proto.receive_kickoff().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::InvalidKickoff)
        );
    }

    #[tokio::test]
    async fn test_wait_in_queue_cleared() {
        let mut proto =
            proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::SrvQueue, b"0")]);
        proto.wait_in_queue().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_in_queue_server_busy() {
        let mut proto =
            proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::SrvQueue, b"9999")]);
        let err = proto.wait_in_queue().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::ServerBusy)
        );
    }

    #[tokio::test]
    async fn test_wait_in_queue_unexpected_type() {
        let mut proto = proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::Login, b"0")]);
        let err = proto.wait_in_queue().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::UnexpectedMessage)
        );
        assert!(format!("{:#}", err).contains("wait_in_queue"));
    }

    #[tokio::test]
    async fn test_wait_in_queue_io_error() {
        let mut proto = proto_with_script(
            KICKOFF_MESSAGE,
            vec![ScriptedRead::Error("connection reset".into())],
        );
        let err = proto.wait_in_queue().await.unwrap_err();
        assert!(format!("{:#}", err).contains("connection reset"));
    }

    #[tokio::test]
    async fn test_receive_version() {
        let mut proto =
            proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::Login, b"v3.7.0")]);
        assert_eq!(proto.receive_version().await.unwrap(), "v3.7.0");
    }

    #[rstest]
    #[case::both(b"2 4".as_slice(), vec![2, 4])]
    #[case::single(b"4".as_slice(), vec![4])]
    #[case::empty(b"".as_slice(), vec![])]
    #[tokio::test]
    async fn test_receive_test_ids(#[case] body: &'static [u8], #[case] expected: Vec<u8>) {
        let mut proto = proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::Login, body)]);
        assert_eq!(proto.receive_test_ids().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_receive_test_ids_non_numeric() {
        let mut proto = proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::Login, b"xx")]);
        assert!(proto.receive_test_ids().await.is_err());
    }

    #[tokio::test]
    async fn test_expect_test_msg_empty_body() {
        let mut proto = proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::TestMsg, b"")]);
        let err = proto.expect_test_msg().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::ExpectedNonEmptyMessage)
        );
    }

    #[tokio::test]
    async fn test_expect_test_prepare_returns_port() {
        let mut proto =
            proto_with_script(KICKOFF_MESSAGE, vec![frame(MessageType::TestPrepare, b"9001")]);
        assert_eq!(proto.expect_test_prepare().await.unwrap(), "9001");
    }

    #[tokio::test]
    async fn test_results_loop_distinguishes_logout() {
        let mut proto = proto_with_script(
            KICKOFF_MESSAGE,
            vec![
                frame(MessageType::Results, b"a: b"),
                frame(MessageType::Logout, b""),
            ],
        );
        let (mtype, body) = proto.receive_logout_or_results().await.unwrap();
        assert_eq!(mtype, MessageType::Results);
        assert_eq!(&body[..], b"a: b");
        let (mtype, _) = proto.receive_logout_or_results().await.unwrap();
        assert_eq!(mtype, MessageType::Logout);
    }

    #[tokio::test]
    async fn test_send_login_records_suite() {
        let (channel, written) = ScriptedControlChannel::new(KICKOFF_MESSAGE, Vec::new());
        let mut proto = ControlProtocol::new(Box::new(channel));
        proto.send_login().await.unwrap();
        let written = written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].mtype, MessageType::Login);
        assert_eq!(&written[0].message[..], &[0x16]);
    }
}
