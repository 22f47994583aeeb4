pub mod events;
pub mod results;
mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::events::Event;
use crate::client::session::Session;
use crate::locate::{MlabLocator, ServerLocator};
use crate::protocol::control::ControlProtocol;
use crate::transport::raw::RawTransport;
use crate::transport::{FrameObserver, NoopFrameObserver, TcpDialer, TransportFactory};

pub const LIBRARY_NAME: &str = "ndt5-client";
pub const LIBRARY_VERSION: &str = "0.1.0";

/// Creates the frame observer attached to a new session's control channel.
///  The observer gets its own handle on the session's event channel, which is
///  how `--verbose` frame dumps end up interleaved with regular events.
pub trait FrameObserverFactory: Sync + Send {
    fn new_observer(&self, events: mpsc::Sender<Event>) -> Box<dyn FrameObserver>;
}

pub struct NoopObserverFactory;

impl FrameObserverFactory for NoopObserverFactory {
    fn new_observer(&self, _events: mpsc::Sender<Event>) -> Box<dyn FrameObserver> {
        Box::new(NoopFrameObserver)
    }
}

/// Tunables of a session. The defaults are the values the NDT5 protocol
///  grew up with; there is rarely a reason to change them outside of tests.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for the whole control conversation, applied right after the
    ///  control connection is established.
    pub control_deadline: Duration,
    pub download_deadline: Duration,
    pub upload_deadline: Duration,
    /// How often the samplers publish a throughput sample.
    pub sample_interval: Duration,
    pub download_read_buffer_size: usize,
    pub upload_message_size: usize,
    /// Upper bound on messages tolerated in the web100 and results loops
    ///  before giving up on ever seeing TEST_FINALIZE / LOGOUT.
    pub max_results_loops: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            control_deadline: Duration::from_secs(45),
            download_deadline: Duration::from_secs(15),
            upload_deadline: Duration::from_secs(10),
            sample_interval: Duration::from_millis(250),
            download_read_buffer_size: 1 << 20,
            upload_message_size: 1 << 17,
            max_results_loops: 128,
        }
    }
}

/// An NDT5 client. Build one with [Client::new], override the public fields
///  to taste (transport, locator, a fixed server FQDN) and call
///  [start](Client::start).
pub struct Client {
    pub client_name: String,
    pub client_version: String,

    /// Server to measure against. When `None`, the locator discovers one.
    pub fqdn: Option<String>,

    pub locator: Box<dyn ServerLocator>,

    /// The transport spoken to the server; raw TCP by default.
    pub transport: Arc<dyn TransportFactory>,

    pub observer_factory: Box<dyn FrameObserverFactory>,

    pub config: ClientConfig,
}

impl Client {
    pub fn new(client_name: &str, client_version: &str, ns_url: &str) -> anyhow::Result<Client> {
        let user_agent = make_user_agent(client_name, client_version);
        Ok(Client {
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
            fqdn: None,
            locator: Box::new(MlabLocator::new(ns_url, "ndt_ssl", &user_agent)?),
            transport: Arc::new(RawTransport::new(Arc::new(TcpDialer::default()))),
            observer_factory: Box::new(NoopObserverFactory),
            config: ClientConfig::default(),
        })
    }

    pub fn user_agent(&self) -> String {
        make_user_agent(&self.client_name, &self.client_version)
    }

    /// Discovers a server (unless one was pinned), dials the control
    ///  connection and starts the session. On success the returned channel
    ///  yields the ordered event stream and is closed when the session ends;
    ///  on failure no session was started.
    pub async fn start(mut self) -> anyhow::Result<mpsc::Receiver<Event>> {
        let fqdn = match self.fqdn.take() {
            Some(fqdn) => fqdn,
            None => self
                .locator
                .locate()
                .await
                .context("cannot locate a suitable server")?,
        };
        let user_agent = self.user_agent();
        let channel = self
            .transport
            .dial_control(&fqdn, &user_agent)
            .await
            .context("cannot dial control connection")?;

        // capacity 1 so the first event can be enqueued before the caller
        //  starts draining
        let (events_tx, events_rx) = mpsc::channel(1);
        let mut proto = ControlProtocol::new(channel);
        proto.set_frame_observer(self.observer_factory.new_observer(events_tx.clone()));
        proto.set_deadline(Instant::now() + self.config.control_deadline);

        let session = Session::new(
            proto,
            Arc::clone(&self.transport),
            fqdn,
            user_agent,
            self.config.clone(),
            events_tx,
        );
        tokio::spawn(session.run());
        Ok(events_rx)
    }
}

pub fn make_user_agent(client_name: &str, client_version: &str) -> String {
    format!(
        "{}/{} {}/{}",
        client_name, client_version, LIBRARY_NAME, LIBRARY_VERSION
    )
}

#[cfg(test)]
mod test {
    use anyhow::bail;
    use async_trait::async_trait;

    use crate::protocol::control::KICKOFF_MESSAGE;
    use crate::protocol::frame::{Frame, MessageType};
    use crate::test_util::{ScriptedRead, ScriptedTransport};

    use super::*;

    struct FixedLocator(&'static str);

    #[async_trait]
    impl ServerLocator for FixedLocator {
        async fn locate(&self) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingLocator;

    #[async_trait]
    impl ServerLocator for FailingLocator {
        async fn locate(&self) -> anyhow::Result<String> {
            bail!("locator must not be consulted")
        }
    }

    fn scripted_client(locator: Box<dyn ServerLocator>, fqdn: Option<String>) -> Client {
        let script = vec![
            ScriptedRead::Frame(Frame::new(MessageType::SrvQueue, b"0").unwrap()),
            ScriptedRead::Frame(Frame::new(MessageType::Login, b"v3.7.0").unwrap()),
            ScriptedRead::Frame(Frame::new(MessageType::Login, b"").unwrap()),
            ScriptedRead::Frame(Frame::new(MessageType::Logout, b"").unwrap()),
        ];
        let transport =
            ScriptedTransport::new(Vec::new()).with_control_script(KICKOFF_MESSAGE, script);
        let mut client = Client::new("ndt5-client-test", "0.1.0", "https://example.org/").unwrap();
        client.locator = locator;
        client.fqdn = fqdn;
        client.transport = Arc::new(transport);
        client
    }

    #[rstest::rstest]
    fn test_user_agent_format() {
        let client = scripted_client(Box::new(FailingLocator), Some("x".into()));
        assert_eq!(
            client.user_agent(),
            "ndt5-client-test/0.1.0 ndt5-client/0.1.0"
        );
    }

    #[tokio::test]
    async fn test_start_uses_pinned_fqdn() {
        let client = scripted_client(Box::new(FailingLocator), Some("pinned.server".into()));
        let mut events = client.start().await.unwrap();
        let first = events.recv().await.unwrap();
        match first {
            Event::Info(m) => assert_eq!(m, "using pinned.server"),
            other => panic!("unexpected first event: {:?}", other),
        }
        while events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_start_discovers_server() {
        let client = scripted_client(Box::new(FixedLocator("located.server")), None);
        let mut events = client.start().await.unwrap();
        let first = events.recv().await.unwrap();
        match first {
            Event::Info(m) => assert_eq!(m, "using located.server"),
            other => panic!("unexpected first event: {:?}", other),
        }
        while events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_start_fails_when_locator_fails() {
        let client = scripted_client(Box::new(FailingLocator), None);
        assert!(client.start().await.is_err());
    }
}
