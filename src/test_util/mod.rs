//! Scripted stand-ins for the transport layer, useful for testing code built
//!  on top of the client without a real NDT5 server. They are used for
//!  testing the crate itself, and exported as regular (non-`#[cfg(test)]`)
//!  code so downstream applications can script sessions too.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::protocol::frame::{Frame, MessageType};
use crate::transport::{
    ControlChannel, FrameObserver, MeasurementChannel, NoopFrameObserver, TransportFactory,
};

/// One step of a control-channel read script: either a frame the fake server
///  sends, or an I/O failure.
pub enum ScriptedRead {
    Frame(Frame),
    Error(String),
}

/// A control channel that replays a fixed read script and records everything
///  written to it.
pub struct ScriptedControlChannel {
    kickoff: Vec<u8>,
    incoming: VecDeque<ScriptedRead>,
    written: Arc<Mutex<Vec<Frame>>>,
    observer: Box<dyn FrameObserver>,
}

impl ScriptedControlChannel {
    /// Returns the channel and a handle on the frames written to it, for
    ///  asserting on after the channel has been handed off.
    pub fn new(
        kickoff: &[u8],
        script: Vec<ScriptedRead>,
    ) -> (ScriptedControlChannel, Arc<Mutex<Vec<Frame>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedControlChannel {
                kickoff: kickoff.to_vec(),
                incoming: script.into(),
                written: Arc::clone(&written),
                observer: Box::new(NoopFrameObserver),
            },
            written,
        )
    }

    async fn record(&mut self, frame: Frame) {
        self.observer.on_write(&frame).await;
        self.written.lock().unwrap().push(frame);
    }
}

#[async_trait]
impl ControlChannel for ScriptedControlChannel {
    fn set_frame_observer(&mut self, observer: Box<dyn FrameObserver>) {
        self.observer = observer;
    }

    fn set_deadline(&mut self, _deadline: Instant) {}

    async fn write_login(&mut self, _version_compat: &str, test_suite: u8) -> anyhow::Result<()> {
        // recorded in the raw-transport convention: the bare suite byte
        let frame = Frame::new(MessageType::Login, &[test_suite])?;
        self.record(frame).await;
        Ok(())
    }

    async fn read_kickoff(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let n = buf.len().min(self.kickoff.len());
        buf[..n].copy_from_slice(&self.kickoff[..n]);
        Ok(())
    }

    async fn read_frame(&mut self) -> anyhow::Result<Frame> {
        match self.incoming.pop_front() {
            Some(ScriptedRead::Frame(frame)) => {
                self.observer.on_read(&frame).await;
                Ok(frame)
            }
            Some(ScriptedRead::Error(message)) => bail!("{}", message),
            None => bail!("control script exhausted"),
        }
    }

    async fn write_message(&mut self, mtype: MessageType, data: &[u8]) -> anyhow::Result<()> {
        let frame = Frame::new(mtype, data)?;
        self.record(frame).await;
        Ok(())
    }

    async fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.record(frame.clone()).await;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A measurement channel that pretends to move bytes at a configurable pace.
///  Downloads replay a list of read sizes and then signal an orderly
///  shutdown; uploads accept a number of writes before failing the way a
///  server closing the connection would.
pub struct ScriptedMeasurementChannel {
    reads: VecDeque<u64>,
    writes_remaining: usize,
    op_delay: Duration,
    prepared_len: u64,
}

impl ScriptedMeasurementChannel {
    pub fn for_download(reads: Vec<u64>, op_delay: Duration) -> ScriptedMeasurementChannel {
        ScriptedMeasurementChannel {
            reads: reads.into(),
            writes_remaining: 0,
            op_delay,
            prepared_len: 0,
        }
    }

    pub fn for_upload(writes: usize, op_delay: Duration) -> ScriptedMeasurementChannel {
        ScriptedMeasurementChannel {
            reads: VecDeque::new(),
            writes_remaining: writes,
            op_delay,
            prepared_len: 0,
        }
    }
}

#[async_trait]
impl MeasurementChannel for ScriptedMeasurementChannel {
    fn set_deadline(&mut self, _deadline: Instant) {}

    fn alloc_read_buffer(&mut self, _size: usize) {}

    async fn read_discard(&mut self) -> anyhow::Result<u64> {
        tokio::time::sleep(self.op_delay).await;
        Ok(self.reads.pop_front().unwrap_or(0))
    }

    fn set_prepared_message(&mut self, body: &[u8]) {
        self.prepared_len = body.len() as u64;
    }

    async fn write_prepared_message(&mut self) -> anyhow::Result<u64> {
        tokio::time::sleep(self.op_delay).await;
        if self.writes_remaining == 0 {
            bail!("measurement connection closed by server");
        }
        self.writes_remaining -= 1;
        Ok(self.prepared_len)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A transport factory handing out scripted channels: at most one control
///  channel, and measurement channels in the order the tests queued them.
pub struct ScriptedTransport {
    control: Mutex<Option<ScriptedControlChannel>>,
    measurements: Mutex<VecDeque<ScriptedMeasurementChannel>>,
    dialed: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(measurements: Vec<ScriptedMeasurementChannel>) -> ScriptedTransport {
        ScriptedTransport {
            control: Mutex::new(None),
            measurements: Mutex::new(measurements.into()),
            dialed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_control_script(
        self,
        kickoff: &[u8],
        script: Vec<ScriptedRead>,
    ) -> ScriptedTransport {
        let (channel, _written) = ScriptedControlChannel::new(kickoff, script);
        *self.control.lock().unwrap() = Some(channel);
        self
    }

    /// Addresses passed to the dial methods so far.
    pub fn dialed_addresses(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for ScriptedTransport {
    async fn dial_control(
        &self,
        address: &str,
        _user_agent: &str,
    ) -> anyhow::Result<Box<dyn ControlChannel>> {
        self.dialed.lock().unwrap().push(address.to_string());
        match self.control.lock().unwrap().take() {
            Some(channel) => Ok(Box::new(channel)),
            None => bail!("no scripted control channel configured"),
        }
    }

    async fn dial_measurement(
        &self,
        address: &str,
        _user_agent: &str,
    ) -> anyhow::Result<Box<dyn MeasurementChannel>> {
        self.dialed.lock().unwrap().push(address.to_string());
        match self.measurements.lock().unwrap().pop_front() {
            Some(channel) => Ok(Box::new(channel)),
            None => bail!("no scripted measurement connection available"),
        }
    }
}
