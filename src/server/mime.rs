const TEXT: &str = "text/plain; charset=utf-8";

/// Content type for a file in a repository, from its extension.
///
/// Source files, markup included, are served as plain text.
pub fn content_type_for(path: &str) -> &'static str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return match file_name {
            "LICENSE" | "README" | "Makefile" | "Dockerfile" | "COPYING" => TEXT,
            _ => "application/octet-stream",
        };
    };

    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "md" | "markdown" => "text/markdown; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "wasm" => "application/wasm",
        "txt" | "rs" | "py" | "c" | "h" | "cc" | "cpp" | "hpp" | "go" | "java" | "kt" | "js"
        | "mjs" | "ts" | "tsx" | "jsx" | "html" | "htm" | "css" | "xml" | "toml" | "yaml"
        | "yml" | "ini" | "cfg" | "sh" | "rb" | "sql" | "lock" | "gitignore" | "gitattributes" => TEXT,
        _ => "application/octet-stream",
    }
}
