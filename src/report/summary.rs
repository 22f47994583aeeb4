use serde::Serialize;

use crate::client::results::TestResult;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValueUnitPair {
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "Unit")]
    pub unit: &'static str,
}

/// What the user sees at the end of a run: connection endpoints plus the
///  derived throughput, latency and retransmission figures. Everything here
///  is computed from the session's [TestResult]; the engine itself never
///  derives these values.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    #[serde(rename = "ServerFQDN")]
    pub server_fqdn: String,
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    #[serde(rename = "ClientIP")]
    pub client_ip: String,
    #[serde(rename = "DownloadUUID")]
    pub download_uuid: String,
    /// Download speed in Mbit/s, measured at the receiver (this client).
    #[serde(rename = "Download")]
    pub download: ValueUnitPair,
    /// Upload speed in Mbit/s, measured at the receiver (the server).
    #[serde(rename = "Upload")]
    pub upload: ValueUnitPair,
    #[serde(rename = "DownloadRetrans")]
    pub download_retrans: ValueUnitPair,
    /// Minimum RTT reported by the server, assumed symmetrical.
    #[serde(rename = "MinRTT")]
    pub min_rtt: ValueUnitPair,
}

impl Summary {
    pub fn from_result(result: &TestResult) -> Summary {
        let mut summary = Summary {
            server_fqdn: result.server_fqdn.clone(),
            ..Default::default()
        };
        if let Some(server_ip) = result.web100.get("NDTResult.S2C.ServerIP") {
            summary.server_ip = server_ip.to_string();
        }
        if let Some(client_ip) = result.web100.get("NDTResult.S2C.ClientIP") {
            summary.client_ip = client_ip.to_string();
        }
        if let Some(uuid) = result.web100.get("NDTResult.S2C.UUID") {
            summary.download_uuid = uuid.to_string();
        }
        if let Some(sample) = result.client_measured_download {
            summary.download = ValueUnitPair {
                value: sample.mbits_per_second(),
                unit: "Mbit/s",
            };
        }
        summary.upload = ValueUnitPair {
            // the server reports kbit/s
            value: result.server_measured_upload_kbps / 1000.0,
            unit: "Mbit/s",
        };
        if let Some(rtt) = parse_web100_f64(result, "TCPInfo.MinRTT") {
            summary.min_rtt = ValueUnitPair {
                // TCPInfo.MinRTT is in microseconds
                value: rtt / 1000.0,
                unit: "ms",
            };
        }
        if let (Some(retrans), Some(sent)) = (
            parse_web100_f64(result, "TCPInfo.BytesRetrans"),
            parse_web100_f64(result, "TCPInfo.BytesSent"),
        ) {
            if sent > 0.0 {
                summary.download_retrans = ValueUnitPair {
                    value: retrans / sent * 100.0,
                    unit: "%",
                };
            }
        }
        summary
    }
}

fn parse_web100_f64(result: &TestResult, key: &str) -> Option<f64> {
    result.web100.get(key).and_then(|v| v.parse().ok())
}
