use std::io::Write;

use anyhow::Context;
use serde::Serialize;

use crate::report::{Reporter, Summary};

/// Renders events as one JSON document per line, suitable for piping into
///  other tooling. Log-style events become `{"Key": ..., "Value": ...}`
///  records; the summary is emitted as a single object.
pub struct JsonLines<W: Write> {
    out: W,
}

#[derive(Serialize)]
struct BatchEvent<'a> {
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Value")]
    value: &'a str,
}

impl<W: Write> JsonLines<W> {
    pub fn new(out: W) -> JsonLines<W> {
        JsonLines { out }
    }

    fn emit(&mut self, value: &impl Serialize) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.out, value).context("serializing output")?;
        self.out.write_all(b"\n").context("writing output")?;
        Ok(())
    }

    fn emit_event(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.emit(&BatchEvent { key, value })
    }
}

impl<W: Write> Reporter for JsonLines<W> {
    fn on_debug(&mut self, message: &str) -> anyhow::Result<()> {
        self.emit_event("debug", message)
    }

    fn on_info(&mut self, message: &str) -> anyhow::Result<()> {
        self.emit_event("info", message)
    }

    fn on_warning(&mut self, message: &str) -> anyhow::Result<()> {
        self.emit_event("warning", message)
    }

    fn on_error(&mut self, message: &str) -> anyhow::Result<()> {
        self.emit_event("error", message)
    }

    fn on_speed(&mut self, test: &str, speed: &str) -> anyhow::Result<()> {
        self.emit_event("speed", &format!("{}: {}", test, speed))
    }

    fn on_summary(&mut self, summary: &Summary) -> anyhow::Result<()> {
        self.emit(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_lines_are_valid_json() {
        let mut out = Vec::new();
        {
            let mut reporter = JsonLines::new(&mut out);
            reporter.on_info("cleared to run the tests").unwrap();
            reporter.on_speed("download", "    93.5000 Mbit/s").unwrap();
        }
        let lines: Vec<&str> = std::str::from_utf8(&out).unwrap().lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["Key"], "info");
        assert_eq!(first["Value"], "cleared to run the tests");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["Key"], "speed");
    }

    #[test]
    fn test_summary_object_field_names() {
        let mut out = Vec::new();
        JsonLines::new(&mut out)
            .on_summary(&Summary {
                server_fqdn: "ndt.example.org".into(),
                ..Default::default()
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["ServerFQDN"], "ndt.example.org");
        assert!(value["Download"]["Value"].is_number());
        assert!(value["MinRTT"]["Unit"].is_string());
    }
}
