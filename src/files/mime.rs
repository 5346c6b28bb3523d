//! MIME lookup collaborator

/// Maps a file extension to a media type.
///
/// The engine only ever asks this one question; embedders with richer MIME
/// databases plug them in through the server builder.
pub trait MimeLookup: Send + Sync + 'static {
    fn mime_from_extension(&self, extension: &str) -> &'static str;
}

/// The built-in extension table.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticMime;

impl MimeLookup for StaticMime {
    fn mime_from_extension(&self, extension: &str) -> &'static str {
        mime_from_extension(extension)
    }
}

/// Media type for an extension, `application/octet-stream` when unknown.
pub fn mime_from_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "avif" => "image/avif",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "csv" => "text/csv",
        "md" => "text/markdown",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        assert_eq!(mime_from_extension("html"), "text/html; charset=utf-8");
        assert_eq!(mime_from_extension("HTML"), "text/html; charset=utf-8");
        assert_eq!(mime_from_extension("txt"), "text/plain");
        assert_eq!(mime_from_extension("woff2"), "font/woff2");
        assert_eq!(mime_from_extension("xyz"), "application/octet-stream");
        assert_eq!(mime_from_extension(""), "application/octet-stream");
    }
}
