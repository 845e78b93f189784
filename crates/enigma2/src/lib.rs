//! Minimal client for the Enigma2 receiver web API.
//!
//! Covers the three calls the control plane needs: probing the receiver,
//! zapping a tuner to a service reference, and resolving the raw TS stream
//! URL for a service. Stream URLs are always taken from the receiver's own
//! playlist endpoint because the receiver assigns stream ports dynamically.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;
use url::Url;

/// Errors produced by the receiver client.
#[derive(Debug, thiserror::Error)]
pub enum Enigma2Error {
    #[error("receiver request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("receiver returned HTTP {0}")]
    Status(StatusCode),

    #[error("invalid receiver URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unusable stream playlist: {0}")]
    Playlist(String),
}

pub type Result<T> = std::result::Result<T, Enigma2Error>;

/// Client for a single Enigma2 receiver.
#[derive(Debug, Clone)]
pub struct Enigma2Client {
    http: reqwest::Client,
    base: Url,
}

impl Enigma2Client {
    /// Create a client for the receiver at `base_url` (scheme + host + web port).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    /// Probe the receiver. Succeeds iff the web API answers at all.
    pub async fn about(&self) -> Result<()> {
        let url = self.endpoint("/web/about")?;
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Enigma2Error::Status(resp.status()));
        }
        Ok(())
    }

    /// Ask the receiver to tune to `service_ref`.
    pub async fn zap(&self, service_ref: &str) -> Result<()> {
        let url = self.endpoint(&format!(
            "/web/zap?sRef={}",
            urlencoding::encode(service_ref)
        ))?;
        debug!(service_ref, "zapping receiver");
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Enigma2Error::Status(resp.status()));
        }
        Ok(())
    }

    /// The receiver's playlist endpoint for a service reference.
    ///
    /// FFmpeg can consume this URL directly; it is also the input to
    /// [`Enigma2Client::stream_url`].
    pub fn playlist_url(&self, service_ref: &str) -> Result<Url> {
        self.endpoint(&format!(
            "/web/stream.m3u?ref={}",
            urlencoding::encode(service_ref)
        ))
    }

    /// Resolve the raw TS stream URL for `service_ref`.
    ///
    /// Fetches the receiver's per-service playlist and returns the first
    /// stream entry. Host and port come from the playlist body, never from
    /// configuration.
    pub async fn stream_url(&self, service_ref: &str) -> Result<Url> {
        let url = self.playlist_url(service_ref)?;
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Enigma2Error::Status(resp.status()));
        }
        let body = resp.text().await?;
        parse_stream_playlist(&body)
    }
}

/// Extract the first stream URL from an Enigma2 `stream.m3u` body.
///
/// The body is a two-line M3U: the `#EXTM3U`/`#EXTINF` header lines followed
/// by one absolute `http://` URL per service.
pub fn parse_stream_playlist(body: &str) -> Result<Url> {
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        return Url::parse(line)
            .map_err(|e| Enigma2Error::Playlist(format!("bad stream entry '{line}': {e}")));
    }
    Err(Enigma2Error::Playlist(
        "playlist contains no stream entries".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_stream_playlist() {
        let body = "#EXTM3U\n#EXTINF:-1,Das Erste HD\nhttp://10.0.0.5:8001/1:0:19:283D:3FB:1:C00000:0:0:0:\n";
        let url = parse_stream_playlist(body).unwrap();
        assert_eq!(url.port(), Some(8001));
        assert_eq!(url.host_str(), Some("10.0.0.5"));
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let body = "#EXTM3U\n\n#EXTINF:-1,x\n\nhttp://box:17999/ref\n";
        let url = parse_stream_playlist(body).unwrap();
        assert_eq!(url.port(), Some(17999));
    }

    #[test]
    fn rejects_empty_playlist() {
        assert!(parse_stream_playlist("#EXTM3U\n").is_err());
        assert!(parse_stream_playlist("").is_err());
    }

    #[test]
    fn rejects_garbage_entries() {
        assert!(parse_stream_playlist("#EXTM3U\nnot a url\n").is_err());
    }

    #[test]
    fn playlist_url_encodes_service_ref() {
        let client = Enigma2Client::new("http://box", Duration::from_secs(5)).unwrap();
        let url = client.playlist_url("1:0:1:445D:453:1:C00000:0:0:0:").unwrap();
        assert!(url.as_str().contains("ref=1%3A0%3A1%3A445D"));
    }
}
