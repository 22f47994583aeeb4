use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::client::events::{Event, Speed};
use crate::client::results::{parse_web100_line, TestResult};
use crate::client::ClientConfig;
use crate::protocol::control::{ControlProtocol, TEST_DOWNLOAD, TEST_UPLOAD};
use crate::protocol::error::ProtocolError;
use crate::protocol::frame::MessageType;
use crate::transport::{MeasurementChannel, TransportFactory};

/// Drives one complete NDT5 session over an established control connection:
///  the login handshake, the tests the server granted, and the results loop.
///  Owns the event sender for its lifetime; the output channel closes when
///  the session task returns.
pub(crate) struct Session {
    proto: ControlProtocol,
    transport: Arc<dyn TransportFactory>,
    fqdn: String,
    user_agent: String,
    config: ClientConfig,
    result: TestResult,
    events: mpsc::Sender<Event>,
}

impl Session {
    pub(crate) fn new(
        proto: ControlProtocol,
        transport: Arc<dyn TransportFactory>,
        fqdn: String,
        user_agent: String,
        config: ClientConfig,
        events: mpsc::Sender<Event>,
    ) -> Session {
        Session {
            proto,
            transport,
            fqdn: fqdn.clone(),
            user_agent,
            config,
            result: TestResult {
                server_fqdn: fqdn,
                ..Default::default()
            },
            events,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.run_inner().await {
            Ok(()) => {
                self.emit_info("finished successfully").await;
                let result = std::mem::take(&mut self.result);
                self.emit(Event::Summary(result)).await;
            }
            Err(e) => self.emit(Event::Error(e)).await,
        }
        if let Err(e) = self.proto.close().await {
            debug!("error closing control connection: {:#}", e);
        }
    }

    /// The linear control-channel state machine. Any error returned here is
    ///  fatal to the session; per-test failures are handled inside and
    ///  surface as error events without ending the session.
    async fn run_inner(&mut self) -> anyhow::Result<()> {
        self.emit_info(format!("using {}", self.fqdn)).await;
        self.proto
            .send_login()
            .await
            .context("cannot send login message")?;
        self.emit_info("sent login message").await;
        self.proto
            .receive_kickoff()
            .await
            .context("cannot receive kickoff message")?;
        self.emit_info("received kickoff").await;
        self.proto
            .wait_in_queue()
            .await
            .context("cannot wait in queue")?;
        self.emit_info("cleared to run the tests").await;
        let version = self
            .proto
            .receive_version()
            .await
            .context("cannot receive server's version")?;
        self.emit_info(format!("got remote server version: {}", version))
            .await;
        let test_ids = self
            .proto
            .receive_test_ids()
            .await
            .context("cannot receive test IDs")?;
        self.emit_info(format!("got list of test IDs: {:?}", test_ids))
            .await;
        for test_id in test_ids {
            match test_id {
                TEST_DOWNLOAD => {
                    self.emit_info("running the download test").await;
                    if let Err(e) = self.run_download().await {
                        self.emit_warning(e.context("download failed")).await;
                        // don't stop testing
                    }
                }
                TEST_UPLOAD => {
                    self.emit_info("running the upload test").await;
                    if let Err(e) = self.run_upload().await {
                        self.emit_warning(e.context("upload failed")).await;
                        // don't stop testing
                    }
                }
                other => debug!("skipping unknown test id {}", other),
            }
        }
        self.emit_info("receiving the results").await;
        self.recv_results_and_logout()
            .await
            .context("cannot receive results")?;
        Ok(())
    }

    async fn run_download(&mut self) -> anyhow::Result<()> {
        let port = self
            .proto
            .expect_test_prepare()
            .await
            .context("cannot get TestPrepare message")?;
        self.emit_info("got TestPrepare message").await;
        let mut conn = self
            .transport
            .dial_measurement(&format!("{}:{}", self.fqdn, port), &self.user_agent)
            .await
            .context("cannot create measurement connection")?;
        self.emit_info("created measurement connection").await;
        conn.set_deadline(Instant::now() + self.config.download_deadline);
        self.proto
            .expect_test_start()
            .await
            .context("cannot get TestStart message")?;
        self.emit_info("got TestStart message").await;
        conn.alloc_read_buffer(self.config.download_read_buffer_size);

        let (sample_tx, mut sample_rx) = mpsc::channel(1);
        let pump = tokio::spawn(downloader(conn, sample_tx, self.config.sample_interval));
        self.emit_info("downloader started").await;
        let mut last_sample: Option<Speed> = None;
        while let Some(speed) = sample_rx.recv().await {
            last_sample = Some(speed);
            self.emit(Event::CurDownloadSpeed(speed)).await;
        }
        let _ = pump.await;
        self.emit_info("downloader terminated").await;

        let speed = self
            .proto
            .expect_test_msg()
            .await
            .context("cannot get TestMsg message")?;
        self.emit_info(format!("got TestMsg: server-measured speed: {} kbit/s", speed))
            .await;

        let client_kbps = match last_sample {
            Some(sample) => {
                self.result.client_measured_download = Some(sample);
                sample.kbits_per_second()
            }
            None => 0.0,
        };
        let client_kbps = format!("{:.6}", client_kbps);
        self.emit_info(format!("client-measured speed: {} kbit/s", client_kbps))
            .await;
        self.proto
            .send_test_msg(client_kbps.as_bytes())
            .await
            .context("cannot send TestMsg message")?;

        for _ in 0..self.config.max_results_loops {
            let (mtype, body) = self
                .proto
                .receive_test_finalize_or_test_msg()
                .await
                .context("cannot get message")?;
            if mtype == MessageType::TestFinalize {
                self.emit_info("test terminated").await;
                return Ok(());
            }
            let line = String::from_utf8_lossy(&body).into_owned();
            self.emit_info(format!("web100: {}", line)).await;
            match parse_web100_line(&line) {
                Ok((key, value)) => self.result.web100.insert(key, value),
                Err(e) => self.emit_warning(e).await,
            }
        }
        Err(anyhow!(ProtocolError::TooManyResults).context("download"))
    }

    async fn run_upload(&mut self) -> anyhow::Result<()> {
        let testdata = make_upload_buffer(self.config.upload_message_size);
        let port = self
            .proto
            .expect_test_prepare()
            .await
            .context("cannot get TestPrepare message")?;
        self.emit_info("got TestPrepare message").await;
        let mut conn = self
            .transport
            .dial_measurement(&format!("{}:{}", self.fqdn, port), &self.user_agent)
            .await
            .context("cannot create measurement connection")?;
        self.emit_info("created measurement connection").await;
        conn.set_deadline(Instant::now() + self.config.upload_deadline);
        self.proto
            .expect_test_start()
            .await
            .context("cannot get TestStart message")?;
        self.emit_info("got TestStart message").await;
        conn.set_prepared_message(&testdata);

        let (sample_tx, mut sample_rx) = mpsc::channel(1);
        let pump = tokio::spawn(uploader(conn, sample_tx, self.config.sample_interval));
        self.emit_info("uploader started").await;
        while let Some(speed) = sample_rx.recv().await {
            self.emit(Event::CurUploadSpeed(speed)).await;
        }
        let _ = pump.await;
        self.emit_info("uploader terminated").await;

        let speed = self
            .proto
            .expect_test_msg()
            .await
            .context("cannot get TestMsg message")?;
        self.emit_info(format!("got TestMsg: server-measured speed: {} kbit/s", speed))
            .await;
        match speed.trim().parse::<f64>() {
            Ok(kbps) => self.result.server_measured_upload_kbps = kbps,
            Err(e) => {
                self.emit_warning(
                    anyhow!(e).context("cannot convert server-measured upload speed"),
                )
                .await
            }
        }
        self.proto
            .expect_test_finalize()
            .await
            .context("cannot get TestFinalize message")?;
        self.emit_info("test terminated").await;
        Ok(())
    }

    async fn recv_results_and_logout(&mut self) -> anyhow::Result<()> {
        for _ in 0..self.config.max_results_loops {
            let (mtype, body) = self
                .proto
                .receive_logout_or_results()
                .await
                .context("cannot get message")?;
            if mtype == MessageType::Logout {
                return Ok(());
            }
            self.emit_info(format!("server: {}", String::from_utf8_lossy(&body)))
                .await;
        }
        Err(anyhow!(ProtocolError::TooManyResults).context("results"))
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped, discarding event");
        }
    }

    async fn emit_info(&self, message: impl Into<String>) {
        self.emit(Event::Info(message.into())).await;
    }

    /// Non-fatal failures surface as error events too, exactly like the
    ///  fatal ones; only the session's control flow distinguishes them.
    async fn emit_warning(&self, err: anyhow::Error) {
        self.emit(Event::Error(err)).await;
    }
}

/// The download byte pump. Owns the measurement connection, reads until the
///  server shuts the stream down (or the deadline fires), and publishes a
///  lossy throughput sample at most every `interval`. Closing the sample
///  channel is what tells the orchestrator the test's data phase is over.
async fn downloader(
    mut conn: Box<dyn MeasurementChannel>,
    samples: mpsc::Sender<Speed>,
    interval: Duration,
) {
    let begin = Instant::now();
    let mut next_sample = begin + interval;
    let mut count: u64 = 0;
    loop {
        match conn.read_discard().await {
            Ok(0) => break,
            Ok(n) => count += n,
            Err(e) => {
                debug!("downloader pump stopped: {:#}", e);
                break;
            }
        }
        if Instant::now() >= next_sample {
            // Non-blocking: if the orchestrator still holds the previous
            //  sample, this one is dropped and the pump keeps going.
            let _ = samples.try_send(Speed {
                count,
                elapsed: begin.elapsed(),
            });
            while next_sample <= Instant::now() {
                next_sample += interval;
            }
        }
    }
    if let Err(e) = conn.close().await {
        debug!("error closing measurement connection: {:#}", e);
    }
}

/// The upload byte pump, mirror image of [downloader]: writes the prepared
///  message until the connection fails (typically because the server closed
///  it when the test period ended).
async fn uploader(
    mut conn: Box<dyn MeasurementChannel>,
    samples: mpsc::Sender<Speed>,
    interval: Duration,
) {
    let begin = Instant::now();
    let mut next_sample = begin + interval;
    let mut count: u64 = 0;
    loop {
        match conn.write_prepared_message().await {
            Ok(n) => count += n,
            Err(e) => {
                debug!("uploader pump stopped: {:#}", e);
                break;
            }
        }
        if Instant::now() >= next_sample {
            let _ = samples.try_send(Speed {
                count,
                elapsed: begin.elapsed(),
            });
            while next_sample <= Instant::now() {
                next_sample += interval;
            }
        }
    }
    if let Err(e) = conn.close().await {
        debug!("error closing measurement connection: {:#}", e);
    }
}

fn make_upload_buffer(size: usize) -> Vec<u8> {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())])
        .collect()
}
