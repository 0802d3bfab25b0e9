//! Content decoding for repository payloads.
//!
//! The contents API ships file bodies base64-encoded with embedded line
//! breaks. Decoding goes through bytes first so multi-byte UTF-8 sequences are
//! never split; anything that is not text degrades to a placeholder.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::error::{RepoError, RepoResult};

/// Decode a base64 transfer-encoded body into text.
pub fn decode_base64_text(path: &str, encoded: &str) -> RepoResult<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| RepoError::decode(format!("{}: invalid base64: {}", path, e)))?;
    Ok(bytes_to_text(path, bytes))
}

/// Encode text for the contents API.
pub fn encode_base64(content: &str) -> String {
    STANDARD.encode(content.as_bytes())
}

/// Interpret raw bytes as text, or return a placeholder for binary data.
pub fn bytes_to_text(path: &str, bytes: Vec<u8>) -> String {
    let len = bytes.len();
    if bytes.contains(&0) {
        return binary_placeholder(path, len);
    }
    match String::from_utf8(bytes) {
        Ok(text) => match text.strip_prefix('\u{feff}') {
            Some(stripped) => stripped.to_string(),
            None => text,
        },
        Err(_) => binary_placeholder(path, len),
    }
}

/// Placeholder shown instead of non-text content.
pub fn binary_placeholder(path: &str, len: usize) -> String {
    format!("[binary file: {} ({} bytes) cannot be displayed]", path, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wrapped_base64() {
        // "hello world\n" split across lines the way the contents API wraps it.
        let encoded = "aGVsbG8g\nd29ybGQK\n";
        assert_eq!(decode_base64_text("a.txt", encoded).unwrap(), "hello world\n");
    }

    #[test]
    fn test_decode_multibyte_utf8() {
        let original = "naïve café — 日本語 🚀";
        let encoded = encode_base64(original);
        // Wrap mid-sequence to prove decoding happens on bytes, not chunks.
        let wrapped = format!("{}\n{}", &encoded[..7], &encoded[7..]);
        assert_eq!(decode_base64_text("u.txt", &wrapped).unwrap(), original);
    }

    #[test]
    fn test_decode_invalid_base64() {
        let err = decode_base64_text("bad.txt", "!!!not base64!!!").unwrap_err();
        assert!(matches!(err, RepoError::Decode(_)));
        assert!(err.to_string().contains("bad.txt"));
    }

    #[test]
    fn test_binary_degrades_to_placeholder() {
        let text = bytes_to_text("logo.png", vec![0x89, b'P', b'N', b'G', 0x00, 0x01]);
        assert_eq!(text, "[binary file: logo.png (6 bytes) cannot be displayed]");

        let latin1 = bytes_to_text("old.txt", vec![0xe9, 0x74, 0xe9]);
        assert!(latin1.starts_with("[binary file: old.txt"));
    }

    #[test]
    fn test_bom_is_stripped() {
        let text = bytes_to_text("bom.txt", "\u{feff}hi".as_bytes().to_vec());
        assert_eq!(text, "hi");
    }
}
