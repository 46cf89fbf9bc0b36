//! HTTP transport for packets
//!
//! GET packets carry their payload in the URL. POST packets carry the bulk
//! JSON body, optionally gzip-compressed. Only 200 and 204 count as
//! delivered; every other outcome is a failure the dispatcher retries.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::error::{Error, Result};

use super::packet::Packet;

/// Per-send knobs, read fresh from the dispatch settings for every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub timeout: Duration,
    pub gzip: bool,
}

/// Sends one packet and reports whether the endpoint accepted it.
///
/// Called only from the dispatcher thread, one packet at a time.
pub trait PacketSender: Send + Sync {
    fn send(&self, packet: &Packet, options: &SendOptions) -> Result<()>;
}

/// Blocking HTTP client for the collection endpoint.
pub struct HttpPacketSender {
    http_client: reqwest::blocking::Client,
}

impl HttpPacketSender {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .user_agent(concat!("tracklet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

impl PacketSender for HttpPacketSender {
    fn send(&self, packet: &Packet, options: &SendOptions) -> Result<()> {
        let request = match packet.body() {
            Some(body) => {
                let request = self
                    .http_client
                    .post(packet.target_url())
                    .header(CONTENT_TYPE, "application/json; charset=utf-8");
                if options.gzip {
                    request
                        .header(CONTENT_ENCODING, "gzip")
                        .body(gzip(body.as_bytes())?)
                } else {
                    request.body(body.to_owned())
                }
            }
            None => self.http_client.get(packet.target_url()),
        };

        let response = request
            .timeout(options.timeout)
            .send()
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            let error_text = response.text().unwrap_or_else(|_| "unknown".to_string());
            tracing::debug!(status = %status, body = %error_text, "Endpoint rejected packet");
            Err(Error::Status(status.as_u16()))
        }
    }
}

/// Gzip `data` in memory.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
