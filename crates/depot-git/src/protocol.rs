//! Git protocol framing (pkt-line, side-band) and capability negotiation
//!
//! Git uses "pkt-line" framing: 4 hex digits length prefix followed by data.
//! Special values: "0000" (flush), "0001" (delimiter), "0002" (response-end)

use std::collections::BTreeSet;

use crate::{Error, Result};

/// Flush packet (marks end of message)
pub const FLUSH_PKT: &[u8] = b"0000";

/// Maximum pkt-line size including the 4-byte length prefix
pub const MAX_PKT_LINE: usize = 65520;

/// Server identification sent in the `agent=` capability
pub const AGENT: &str = concat!("depot/", env!("CARGO_PKG_VERSION"));

/// Write a pkt-line
pub fn pkt_line(data: &[u8]) -> Vec<u8> {
    let len = data.len() + 4;
    let mut pkt = format!("{:04x}", len).into_bytes();
    pkt.extend_from_slice(data);
    pkt
}

/// Write a pkt-line with newline suffix
pub fn pkt_line_with_newline(data: &str) -> Vec<u8> {
    let line = format!("{}\n", data);
    pkt_line(line.as_bytes())
}

/// Parse pkt-lines from a buffer
pub struct PktLineReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PktLineReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read the next pkt-line. `None` at end of input.
    pub fn read(&mut self) -> Result<Option<PktLine<'a>>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        if self.pos + 4 > self.data.len() {
            return Err(Error::ProtocolError("pkt-line truncated".into()));
        }

        let len_hex = std::str::from_utf8(&self.data[self.pos..self.pos + 4])
            .map_err(|_| Error::ProtocolError("invalid pkt-line length".into()))?;

        let special = match len_hex {
            "0000" => Some(PktLine::Flush),
            "0001" => Some(PktLine::Delimiter),
            "0002" => Some(PktLine::ResponseEnd),
            _ => None,
        };
        if let Some(special) = special {
            self.pos += 4;
            return Ok(Some(special));
        }

        let len = usize::from_str_radix(len_hex, 16)
            .map_err(|_| Error::ProtocolError("invalid pkt-line length".into()))?;

        if len < 4 {
            return Err(Error::ProtocolError("pkt-line length too small".into()));
        }

        if len > MAX_PKT_LINE {
            return Err(Error::ProtocolError("pkt-line too large".into()));
        }

        if self.pos + len > self.data.len() {
            return Err(Error::ProtocolError("pkt-line truncated".into()));
        }

        let payload = &self.data[self.pos + 4..self.pos + len];
        self.pos += len;

        Ok(Some(PktLine::Data(payload)))
    }

    /// Read data lines until a flush or end of input
    pub fn read_until_flush(&mut self) -> Result<Vec<&'a [u8]>> {
        let mut lines = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | Some(PktLine::ResponseEnd) | None => break,
                Some(PktLine::Data(data)) => lines.push(data),
                Some(PktLine::Delimiter) => continue,
            }
        }
        Ok(lines)
    }

    /// Remaining bytes (e.g. the packfile after the command list)
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// A pkt-line entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine<'a> {
    Flush,
    Delimiter,
    ResponseEnd,
    Data(&'a [u8]),
}

/// Build pkt-line responses
#[derive(Debug, Default)]
pub struct PktLineWriter {
    buffer: Vec<u8>,
}

impl PktLineWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(&pkt_line(data));
    }

    pub fn write_str(&mut self, s: &str) {
        self.buffer.extend_from_slice(&pkt_line_with_newline(s));
    }

    pub fn flush(&mut self) {
        self.buffer.extend_from_slice(FLUSH_PKT);
    }

    /// Write `data` on a side-band channel, split to the mode's packet size.
    /// Without side-band, data-channel bytes are written raw and progress
    /// is dropped.
    pub fn write_band(&mut self, mode: Sideband, channel: u8, data: &[u8]) {
        match mode.max_payload() {
            Some(max) => {
                for chunk in data.chunks(max) {
                    let mut payload = Vec::with_capacity(chunk.len() + 1);
                    payload.push(channel);
                    payload.extend_from_slice(chunk);
                    self.write(&payload);
                }
            }
            None if channel == sideband::DATA => self.buffer.extend_from_slice(data),
            None => {}
        }
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Side-band channel IDs
pub mod sideband {
    pub const DATA: u8 = 1;
    pub const PROGRESS: u8 = 2;
    pub const ERROR: u8 = 3;
}

/// Side-band framing negotiated by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sideband {
    None,
    /// `side-band`: packets up to 1000 bytes
    Band,
    /// `side-band-64k`: packets up to 65520 bytes
    Band64k,
}

impl Sideband {
    /// Largest payload per packet, excluding the length and channel bytes
    fn max_payload(&self) -> Option<usize> {
        match self {
            Sideband::None => None,
            Sideband::Band => Some(1000 - 5),
            Sideband::Band64k => Some(MAX_PKT_LINE - 5),
        }
    }
}

/// Capabilities a client requested on its first want/command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn parse(caps_str: &str) -> Self {
        Self(
            caps_str
                .split(' ')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Side-band mode, preferring the 64k variant
    pub fn sideband(&self) -> Sideband {
        if self.has("side-band-64k") {
            Sideband::Band64k
        } else if self.has("side-band") {
            Sideband::Band
        } else {
            Sideband::None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Server capabilities for upload-pack
pub const UPLOAD_PACK_CAPABILITIES: &[&str] = &[
    "multi_ack",
    "multi_ack_detailed",
    "side-band-64k",
    "side-band",
    "thin-pack",
    "ofs-delta",
    "no-progress",
    "allow-tip-sha1-in-want",
    "allow-reachable-sha1-in-want",
];

/// Server capabilities for receive-pack
pub const RECEIVE_PACK_CAPABILITIES: &[&str] = &[
    "report-status",
    "delete-refs",
    "side-band-64k",
    "ofs-delta",
    "atomic",
];

/// Capability string for the first advertised ref
pub fn format_capabilities(caps: &[&str], symref_head: Option<&str>) -> String {
    let mut all: Vec<String> = caps.iter().map(|c| c.to_string()).collect();
    if let Some(target) = symref_head {
        all.push(format!("symref=HEAD:{}", target));
    }
    all.push(format!("agent={}", AGENT));
    all.join(" ")
}

/// Strip one trailing newline from a pkt-line payload
pub fn trim_line(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\n").unwrap_or(data)
}
