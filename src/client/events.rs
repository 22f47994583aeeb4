use std::time::Duration;

use crate::client::results::TestResult;

/// A throughput sample taken by one of the measurement pumps: total bytes
///  moved since the test began, and how long that took. Within one test,
///  both fields are monotonically non-decreasing across samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Speed {
    pub count: u64,
    pub elapsed: Duration,
}

impl Speed {
    pub fn mbits_per_second(&self) -> f64 {
        let micros = self.elapsed.as_micros();
        if micros == 0 {
            return 0.0;
        }
        8.0 * self.count as f64 / micros as f64
    }

    pub fn kbits_per_second(&self) -> f64 {
        let millis = self.elapsed.as_millis();
        if millis == 0 {
            return 0.0;
        }
        8.0 * self.count as f64 / millis as f64
    }
}

/// What a session emits on its output channel. The stream is totally ordered
///  and finite: after the session ends (successfully or not) the channel is
///  closed and no further events appear.
#[derive(Debug)]
pub enum Event {
    Info(String),
    Warning(anyhow::Error),
    Error(anyhow::Error),
    Debug(String),
    CurDownloadSpeed(Speed),
    CurUploadSpeed(Speed),
    /// Emitted last, only when the session succeeds.
    Summary(TestResult),
}
