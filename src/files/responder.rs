//! Static file serving: caching, conditional GET, byte ranges

use crate::errors::HttpError;
use crate::files::etag::compute_etag;
use crate::files::range::{
    if_range_matches, multipart_content_length, parse_ranges, part_header, terminator, ByteRange,
    RangeOutcome, PART_TAIL,
};
use crate::http::response::Handled;
use crate::http::types::{Method, StatusCode};
use crate::server::connection::{HttpConnection, Stream};
use std::io::SeekFrom;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Options for [`HttpConnection::send_file`].
#[derive(Debug, Clone)]
pub struct FileOptions {
    /// Overrides the MIME type derived from the file extension.
    pub content_type: Option<String>,
    /// Whether caching headers and an ETag may be emitted (still subject to
    /// the per-extension cacheable set). Default `true`.
    pub can_cache: bool,
    /// Serve as a download with this filename in `Content-Disposition`.
    pub download_as: Option<String>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            content_type: None,
            can_cache: true,
            download_as: None,
        }
    }
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name != ".."
        && name
            .chars()
            .all(|c| !c.is_control() && !matches!(c, '/' | '\\' | '"'))
}

fn unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

impl<S: Stream> HttpConnection<S> {
    /// Serves a file from disk with caching headers, conditional-GET
    /// validators, negotiated compression, and byte-range support.
    pub async fn send_file(
        &mut self,
        path: &Path,
        options: &FileOptions,
    ) -> Result<Handled, HttpError> {
        let mut file = File::open(path).await?;
        let metadata = file.metadata().await?;
        let size = metadata.len();
        let modified = metadata.modified().unwrap_or(UNIX_EPOCH);

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_owned();
        let content_type = match &options.content_type {
            Some(ct) => ct.clone(),
            None => self.config.mime.mime_from_extension(&extension).to_owned(),
        };

        let response = self.response_mut();
        response.set_content_type(&content_type)?;
        response.headers().set("Accept-Ranges", Some("bytes"))?;

        if let Some(filename) = &options.download_as {
            if !is_safe_filename(filename) {
                return Err(HttpError::Internal(format!(
                    "unsafe download filename: {filename:?}"
                )));
            }
            response.headers().set(
                "Content-Disposition",
                Some(&format!("attachment; filename=\"{filename}\"")),
            )?;
        }

        let cacheable = options.can_cache && self.config.file.is_cacheable_extension(&extension);
        let mut etag = None;
        let mut last_modified = None;
        if cacheable {
            let last_modified_value = httpdate::fmt_http_date(modified);
            let max_age = self.config.file.cache_max_age;
            let tag = compute_etag(&mut file, size, unix_millis(modified)).await?;

            let response = self.response_mut();
            response
                .headers()
                .set("Date", Some(&httpdate::fmt_http_date(SystemTime::now())))?;
            response
                .headers()
                .set("Last-Modified", Some(&last_modified_value))?;
            response.headers().set("Age", Some("0"))?;
            response
                .headers()
                .set("Cache-Control", Some(&format!("max-age={max_age}, public")))?;
            response.headers().set("ETag", Some(&tag))?;

            etag = Some(tag);
            last_modified = Some(last_modified_value);
        } else {
            self.response_mut()
                .headers()
                .set("Cache-Control", Some("no-cache"))?;
        }

        // Conditional GET: If-None-Match wins over If-Modified-Since.
        let not_modified = match (&etag, self.request().headers().get("If-None-Match")) {
            (Some(tag), Some(candidate)) => candidate == *tag,
            _ => match (&last_modified, self.request().headers().get("If-Modified-Since")) {
                (Some(ours), Some(theirs)) => theirs.eq_ignore_ascii_case(ours),
                _ => false,
            },
        };
        if not_modified {
            self.response_mut().set_status(StatusCode::NotModified)?;
            return Ok(Handled(()));
        }

        let compressible = self.negotiated_compression.is_some()
            && size > self.config.resp.compression_threshold
            && self.config.resp.is_compressible_extension(&extension);

        // If-Range with a stale validator demotes the request to full content.
        let range_header = match self.request().headers().get("If-Range") {
            Some(validator)
                if !if_range_matches(&validator, etag.as_deref(), last_modified.as_deref()) =>
            {
                None
            }
            _ => self.request().headers().get("Range"),
        };
        let outcome = match range_header {
            Some(header) => match parse_ranges(&header, size) {
                Ok(outcome) => outcome,
                Err(HttpError::RangeUnsatisfiable) => {
                    let response = self.response_mut();
                    response.set_status(StatusCode::RangeNotSatisfiable)?;
                    response
                        .headers()
                        .set("Content-Range", Some(&format!("bytes */{size}")))?;
                    response.set_content_length(0)?;
                    return Ok(Handled(()));
                }
                Err(error) => return Err(error),
            },
            None => RangeOutcome::Full,
        };

        let is_head = self.request().method() == Method::Head;
        match outcome {
            RangeOutcome::Full => {
                if compressible {
                    let compression = self.negotiated_compression;
                    self.response_mut().set_compression(compression)?;
                } else {
                    self.response_mut().set_content_length(size)?;
                }
                if is_head {
                    return Ok(Handled(()));
                }

                self.begin_body().await?;
                file.seek(SeekFrom::Start(0)).await?;
                self.copy_file_slice(&mut file, size).await?;
                Ok(self.end_body())
            }

            RangeOutcome::Single(range) => {
                let response = self.response_mut();
                response.set_status(StatusCode::PartialContent)?;
                response.headers().set(
                    "Content-Range",
                    Some(&format!("bytes {}-{}/{size}", range.start, range.end)),
                )?;
                response.set_content_length(range.len())?;
                if is_head {
                    return Ok(Handled(()));
                }

                self.begin_body().await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                self.copy_file_slice(&mut file, range.len()).await?;
                Ok(self.end_body())
            }

            RangeOutcome::Multi(ranges) => {
                let boundary = format!("{:x}", unix_millis(SystemTime::now()));
                let total_length =
                    multipart_content_length(&ranges, &boundary, &content_type, size);

                let response = self.response_mut();
                response.set_status(StatusCode::PartialContent)?;
                response.set_content_type(&format!(
                    "multipart/byteranges; boundary={boundary}"
                ))?;
                response.set_content_length(total_length)?;
                if is_head {
                    return Ok(Handled(()));
                }

                self.begin_body().await?;
                for range in &ranges {
                    self.write_body(&part_header(&boundary, &content_type, *range, size))
                        .await?;
                    file.seek(SeekFrom::Start(range.start)).await?;
                    self.copy_file_slice(&mut file, range.len()).await?;
                    self.write_body(PART_TAIL).await?;
                }
                self.write_body(&terminator(&boundary)).await?;
                Ok(self.end_body())
            }
        }
    }

    async fn copy_file_slice(&mut self, file: &mut File, mut count: u64) -> Result<(), HttpError> {
        let mut buf = [0u8; 64 * 1024];
        while count > 0 {
            let want = buf.len().min(count.min(usize::MAX as u64) as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(HttpError::Internal(
                    "file shrank while serving its body".into(),
                ));
            }
            self.write_body(&buf[..n]).await?;
            count -= n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::errors::HttpError;
    use crate::files::mime::StaticMime;
    use crate::http::response::Handled;
    use crate::limits::{ConnLimits, FileLimits, ProxyHeaderConfig, ReqLimits, RespLimits};
    use crate::server::connection::{CancelToken, ConnectionInfo, EngineConfig, HttpConnection};
    use crate::server::counters::ServerCounters;
    use crate::server::server_impl::Handler;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct ServeFile {
        path: PathBuf,
        options: FileOptions,
    }

    impl Handler<DuplexStream> for ServeFile {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            conn.send_file(&self.path, &self.options).await
        }
    }

    fn config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            conn: ConnLimits::default(),
            req: ReqLimits::default(),
            resp: RespLimits::default(),
            file: FileLimits::default(),
            proxy: ProxyHeaderConfig::default(),
            app_path: None,
            trust: Arc::new(()),
            mime: Arc::new(StaticMime),
            max_connections: 100,
        })
    }

    async fn drive(path: &Path, options: FileOptions, request: &[u8]) -> Vec<u8> {
        let (mut client, server) = tokio::io::duplex(512 * 1024);
        let mut engine = HttpConnection::new(
            server,
            ConnectionInfo {
                id: 7,
                remote_addr: "127.0.0.1:5000".parse().unwrap(),
                local_addr: "127.0.0.1:8080".parse().unwrap(),
                secure: false,
            },
            config(),
            Arc::new(ServerCounters::new()),
            CancelToken::new(),
        );
        let handler = ServeFile {
            path: path.to_owned(),
            options,
        };

        let task = tokio::spawn(async move {
            engine.run(&handler).await;
        });
        let _ = client.write_all(request).await;
        let _ = client.shutdown().await;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    async fn drive_text(path: &Path, options: FileOptions, request: &[u8]) -> String {
        String::from_utf8(drive(path, options, request).await).unwrap()
    }

    fn scratch(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "hearth_responder_{}_{name}",
            std::process::id()
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
        response
            .lines()
            .find_map(|line| line.strip_prefix(&format!("{name}: ")))
    }

    #[tokio::test]
    async fn conditional_get_round_trip() {
        let path = scratch("cond.txt", &vec![b'a'; 100]);

        let first = drive_text(
            &path,
            FileOptions::default(),
            b"GET /f.txt HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{first}");
        assert!(first.contains("Content-Length: 100\r\n"), "{first}");
        assert!(first.contains("Cache-Control: max-age=604800, public\r\n"), "{first}");
        assert!(first.contains("Age: 0\r\n"), "{first}");
        assert!(header_value(&first, "Last-Modified").is_some(), "{first}");
        let etag = header_value(&first, "Etag").unwrap().to_owned();
        assert!(etag.starts_with('"') && etag.ends_with('"'), "{etag}");

        let request = format!(
            "GET /f.txt HTTP/1.1\r\nHost: h\r\nIf-None-Match: {etag}\r\nConnection: close\r\n\r\n"
        );
        let second = drive_text(&path, FileOptions::default(), request.as_bytes()).await;
        assert!(second.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{second}");
        assert!(!second.contains("Content-Length"), "{second}");
        assert!(second.ends_with("\r\n\r\n"), "{second}");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn if_modified_since_matches_case_insensitively() {
        let path = scratch("ims.txt", b"0123456789");

        let first = drive_text(
            &path,
            FileOptions::default(),
            b"GET /f.txt HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
        )
        .await;
        let last_modified = header_value(&first, "Last-Modified").unwrap().to_uppercase();

        let request = format!(
            "GET /f.txt HTTP/1.1\r\nHost: h\r\nIf-Modified-Since: {last_modified}\r\nConnection: close\r\n\r\n"
        );
        let second = drive_text(&path, FileOptions::default(), request.as_bytes()).await;
        assert!(second.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{second}");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn single_range_is_a_partial_content_slice() {
        let body: Vec<u8> = (0..1000u32).map(|i| b'a' + (i % 26) as u8).collect();
        let path = scratch("single.bin", &body);

        let response = drive_text(
            &path,
            FileOptions::default(),
            b"GET /f.bin HTTP/1.1\r\nHost: h\r\nRange: bytes=10-19\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{response}");
        assert!(response.contains("Content-Range: bytes 10-19/1000\r\n"), "{response}");
        assert!(response.contains("Content-Length: 10\r\n"), "{response}");

        let payload = response.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(payload.len(), 10);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn multipart_ranges_match_the_advertised_length() {
        let path = scratch("multi.txt", &vec![b'z'; 1000]);

        let response = drive_text(
            &path,
            FileOptions {
                can_cache: false,
                ..FileOptions::default()
            },
            b"GET /f.txt HTTP/1.1\r\nHost: h\r\nRange: bytes=0-99,200-299\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{response}");

        let content_type = header_value(&response, "Content-Type").unwrap();
        let boundary = content_type
            .strip_prefix("multipart/byteranges; boundary=")
            .unwrap()
            .to_owned();
        let advertised: usize = header_value(&response, "Content-Length")
            .unwrap()
            .parse()
            .unwrap();

        let body_start = response.find("\r\n\r\n").unwrap() + 4;
        let body = &response[body_start..];
        assert_eq!(body.len(), advertised, "{response}");

        assert!(
            body.starts_with(&format!(
                "--{boundary}\r\nContent-Type: text/plain\r\nContent-Range: bytes 0-99/1000\r\n\r\n"
            )),
            "{body}"
        );
        assert!(
            body.contains(&format!(
                "\r\n--{boundary}\r\nContent-Type: text/plain\r\nContent-Range: bytes 200-299/1000\r\n\r\n"
            )),
            "{body}"
        );
        assert!(body.ends_with(&format!("--{boundary}--")), "{body}");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_a_416() {
        let path = scratch("un.bin", &vec![0u8; 1000]);

        let response = drive_text(
            &path,
            FileOptions::default(),
            b"GET /f.bin HTTP/1.1\r\nHost: h\r\nRange: bytes=2000-3000\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(
            response.starts_with("HTTP/1.1 416 Requested Range Not Satisfiable\r\n"),
            "{response}"
        );
        assert!(response.contains("Content-Range: bytes */1000\r\n"), "{response}");
        assert!(response.contains("Content-Length: 0\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\n"), "{response}");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn negotiated_compression_is_transparent() {
        use std::io::Read as _;

        let content = b"compressible text content ".repeat(100);
        let path = scratch("comp.txt", &content);

        let response_bytes = drive(
            &path,
            FileOptions::default(),
            b"GET /f.txt HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&response_bytes);
        assert!(text.contains("Content-Encoding: gzip\r\n"), "{text}");
        assert!(!text.contains("Content-Length"), "{text}");

        // Connection: close means no chunking; the compressed stream runs to EOF
        let body_start = response_bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&response_bytes[body_start..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, content);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn head_sends_headers_only() {
        let path = scratch("head.txt", &vec![b'h'; 300]);

        let response = drive_text(
            &path,
            FileOptions::default(),
            b"HEAD /f.txt HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Content-Length: 300\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\n"), "{response}");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn download_disposition_and_no_cache() {
        let path = scratch("dl.html", b"<html></html>");

        let response = drive_text(
            &path,
            FileOptions {
                download_as: Some("report.html".into()),
                ..FileOptions::default()
            },
            b"GET /dl HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
        )
        .await;
        // html is not cacheable by default
        assert!(response.contains("Cache-Control: no-cache\r\n"), "{response}");
        assert!(!response.contains("Etag"), "{response}");
        assert!(
            response.contains("Content-Disposition: attachment; filename=\"report.html\"\r\n"),
            "{response}"
        );

        std::fs::remove_file(&path).unwrap();
    }
}
