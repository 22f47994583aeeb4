use std::io::{self, Write};

use anyhow::Context;

use crate::report::{Reporter, Summary};

/// Renders events as plain stdout lines, one per event, with the summary as
///  an aligned block at the end.
pub struct HumanReadable<W: Write> {
    out: W,
}

impl HumanReadable<io::Stdout> {
    pub fn new() -> HumanReadable<io::Stdout> {
        HumanReadable { out: io::stdout() }
    }
}

impl Default for HumanReadable<io::Stdout> {
    fn default() -> Self {
        HumanReadable::new()
    }
}

impl<W: Write> HumanReadable<W> {
    pub fn with_writer(out: W) -> HumanReadable<W> {
        HumanReadable { out }
    }

    fn line(&mut self, message: &str) -> anyhow::Result<()> {
        writeln!(self.out, "\r{}", message).context("writing output")
    }
}

impl<W: Write> Reporter for HumanReadable<W> {
    fn on_debug(&mut self, message: &str) -> anyhow::Result<()> {
        self.line(message)
    }

    fn on_info(&mut self, message: &str) -> anyhow::Result<()> {
        self.line(message)
    }

    fn on_warning(&mut self, message: &str) -> anyhow::Result<()> {
        self.line(message)
    }

    fn on_error(&mut self, message: &str) -> anyhow::Result<()> {
        self.line(message)
    }

    fn on_speed(&mut self, test: &str, speed: &str) -> anyhow::Result<()> {
        self.line(&format!("{}: {}", test, speed))
    }

    fn on_summary(&mut self, summary: &Summary) -> anyhow::Result<()> {
        write!(
            self.out,
            "{:>15}: {}\n\
             {:>15}: {}\n\
             {:>15}: {:7.1} {}\n\
             {:>15}: {:7.1} {}\n\
             {:>15}: {:7.1} {}\n\
             {:>15}: {:7.2} {}\n",
            "Server",
            summary.server_fqdn,
            "Client",
            summary.client_ip,
            "Latency",
            summary.min_rtt.value,
            summary.min_rtt.unit,
            "Download",
            summary.download.value,
            summary.download.unit,
            "Upload",
            summary.upload.value,
            summary.upload.unit,
            "Retransmission",
            summary.download_retrans.value,
            summary.download_retrans.unit,
        )
        .context("writing summary")
    }
}

#[cfg(test)]
mod test {
    use crate::report::ValueUnitPair;

    use super::*;

    #[test]
    fn test_info_line() {
        let mut out = Vec::new();
        HumanReadable::with_writer(&mut out)
            .on_info("sent login message")
            .unwrap();
        assert_eq!(out, b"\rsent login message\n");
    }

    #[test]
    fn test_summary_block() {
        let summary = Summary {
            server_fqdn: "ndt.example.org".into(),
            client_ip: "198.51.100.9".into(),
            download: ValueUnitPair {
                value: 93.5,
                unit: "Mbit/s",
            },
            upload: ValueUnitPair {
                value: 2.5,
                unit: "Mbit/s",
            },
            min_rtt: ValueUnitPair {
                value: 12.0,
                unit: "ms",
            },
            download_retrans: ValueUnitPair {
                value: 0.52,
                unit: "%",
            },
            ..Default::default()
        };
        let mut out = Vec::new();
        HumanReadable::with_writer(&mut out)
            .on_summary(&summary)
            .unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("         Server: ndt.example.org\n"));
        assert!(rendered.contains("       Download:    93.5 Mbit/s\n"));
        assert!(rendered.contains(" Retransmission:    0.52 %\n"));
    }
}
