mod human;
mod json;
mod quiet;
mod summary;

pub use human::HumanReadable;
pub use json::JsonLines;
pub use quiet::Quiet;
pub use summary::{Summary, ValueUnitPair};

use crate::client::events::Speed;

/// Consumes the session's event stream in rendered form. One method per
///  event kind; an error generally means the output could not be written
///  (e.g. a closed pipe) and aborts the run.
pub trait Reporter {
    fn on_debug(&mut self, message: &str) -> anyhow::Result<()>;
    fn on_info(&mut self, message: &str) -> anyhow::Result<()>;
    fn on_warning(&mut self, message: &str) -> anyhow::Result<()>;
    fn on_error(&mut self, message: &str) -> anyhow::Result<()>;
    fn on_speed(&mut self, test: &str, speed: &str) -> anyhow::Result<()>;
    fn on_summary(&mut self, summary: &Summary) -> anyhow::Result<()>;
}

pub fn format_speed(speed: &Speed) -> String {
    format!("{:11.4} Mbit/s", speed.mbits_per_second())
}
