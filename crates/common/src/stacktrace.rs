//! Stack-trace normalization and crash deduplication.
//!
//! Two crashes are "the same" when their normalized stack traces match.
//! Normalization keeps the crash kind and the top in-program frames while
//! dropping everything that varies between runs: addresses, line/column
//! numbers, sanitizer runtime frames.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::error::Result;

/// Frames kept in the fingerprint.
const MAX_FRAMES: usize = 8;

fn hex_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap())
}

fn line_col_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":\d+(:\d+)?").unwrap())
}

fn frame_re() -> &'static Regex {
    // "#0 0x55e4 in png_read_row /src/pngread.c:123:4"
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*#\d+\s+\S+\s+in\s+(\S+)").unwrap())
}

fn java_frame_re() -> &'static Regex {
    // "at com.example.Parser.parse(Parser.java:42)"
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*at\s+([\w.$]+)\(").unwrap())
}

fn error_line_re() -> &'static Regex {
    // "==12==ERROR: AddressSanitizer: heap-buffer-overflow on address ..."
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ERROR:\s+(\w+Sanitizer):\s+([\w-]+)").unwrap())
}

fn is_runtime_frame(function: &str) -> bool {
    function.starts_with("__asan")
        || function.starts_with("__msan")
        || function.starts_with("__ubsan")
        || function.starts_with("__sanitizer")
        || function.starts_with("__interceptor")
        || function.starts_with("fuzzer::")
}

/// Canonical form of a stack trace: crash kind plus the top frames'
/// function names, addresses and positions removed.
pub fn normalize_stacktrace(stacktrace: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(caps) = error_line_re().captures(stacktrace) {
        parts.push(format!("{}:{}", &caps[1], &caps[2]));
    }

    for line in stacktrace.lines() {
        if parts.len() > MAX_FRAMES {
            break;
        }
        let function = frame_re()
            .captures(line)
            .or_else(|| java_frame_re().captures(line))
            .map(|caps| caps[1].to_string());
        if let Some(function) = function {
            let function = hex_address_re().replace_all(&function, "").into_owned();
            let function = line_col_re().replace_all(&function, "").into_owned();
            if function.is_empty() || is_runtime_frame(&function) {
                continue;
            }
            parts.push(function);
        }
    }

    parts.join("|")
}

/// Deduplication token for a stack trace.
pub fn crash_token(stacktrace: &str) -> String {
    let normalized = normalize_stacktrace(stacktrace);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Per-task set of known crash tokens. Distinct pipeline stages keep
/// distinct sets by choosing different prefixes.
#[derive(Clone)]
pub struct CrashSet {
    conn: ConnectionManager,
    prefix: String,
}

impl CrashSet {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_prefix(conn, "crash_set")
    }

    pub fn with_prefix(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
        }
    }

    fn set_key(&self, task_id: &str) -> String {
        format!("{}:{}", self.prefix, task_id.to_lowercase())
    }

    /// Record a token. Returns true when the token was already known,
    /// false when this is a new crash worth keeping.
    pub async fn add(&self, task_id: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(self.set_key(task_id), token).await?;
        Ok(added == 0)
    }

    pub async fn contains(&self, task_id: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(self.set_key(task_id), token).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASAN_TRACE: &str = "\
==1234==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602000000050
READ of size 4 at 0x602000000050 thread T0
    #0 0x55e4a1b2 in png_read_row /src/libpng/pngread.c:543:9
    #1 0x55e4a2c3 in __interceptor_memcpy /llvm/compiler-rt/asan_interceptors.cpp:22
    #2 0x55e4a3d4 in read_chunk /src/libpng/pngrutil.c:210:5
    #3 0x55e4a4e5 in LLVMFuzzerTestOneInput /src/harness/read_fuzzer.c:31:3
";

    #[test]
    fn fingerprint_ignores_addresses_and_line_numbers() {
        let shifted = ASAN_TRACE
            .replace("0x55e4a1b2", "0x7fff0001")
            .replace("pngread.c:543:9", "pngread.c:544:1")
            .replace("==1234==", "==9876==");
        assert_eq!(crash_token(ASAN_TRACE), crash_token(&shifted));
    }

    #[test]
    fn fingerprint_distinguishes_different_crashes() {
        let other = ASAN_TRACE.replace("png_read_row", "png_write_row");
        assert_ne!(crash_token(ASAN_TRACE), crash_token(&other));
    }

    #[test]
    fn normalization_keeps_crash_kind_and_frames() {
        let normalized = normalize_stacktrace(ASAN_TRACE);
        assert!(normalized.starts_with("AddressSanitizer:heap-buffer-overflow"));
        assert!(normalized.contains("png_read_row"));
        assert!(normalized.contains("read_chunk"));
        assert!(!normalized.contains("__interceptor_memcpy"));
        assert!(!normalized.contains("0x55e4"));
    }

    #[test]
    fn java_frames_are_fingerprinted() {
        let trace = "\
== Java Exception: java.lang.ArrayIndexOutOfBoundsException
    at com.example.Parser.parse(Parser.java:42)
    at com.example.Fuzzer.fuzzerTestOneInput(Fuzzer.java:17)
";
        let normalized = normalize_stacktrace(trace);
        assert!(normalized.contains("com.example.Parser.parse"));
        let moved = trace.replace("Parser.java:42", "Parser.java:57");
        assert_eq!(crash_token(trace), crash_token(&moved));
    }

    #[test]
    fn empty_trace_still_produces_a_token() {
        assert_eq!(crash_token(""), crash_token(""));
        assert_ne!(crash_token(""), crash_token(ASAN_TRACE));
    }
}
