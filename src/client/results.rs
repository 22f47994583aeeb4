use anyhow::anyhow;

use crate::client::events::Speed;

/// The web100 variables the server ships at the end of a download test, as
///  `key: value` text lines. Insertion order is preserved so that reporters
///  can show the variables the way the server sent them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Web100Map {
    entries: Vec<(String, String)>,
}

impl Web100Map {
    pub fn insert(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses one web100 message: a colon-delimited key/value pair, both sides
///  trimmed of whitespace.
pub fn parse_web100_line(line: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| anyhow!("cannot parse web100 message: {}", line))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

/// Everything a finished session knows: the last client-side download sample,
///  the server-measured upload rate and the web100 variables. Shipped to the
///  caller inside the final `Summary` event.
#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub server_fqdn: String,
    pub client_measured_download: Option<Speed>,
    pub server_measured_upload_kbps: f64,
    pub web100: Web100Map,
}
