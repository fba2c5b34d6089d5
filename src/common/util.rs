use std::borrow::Cow;

use base64::Engine;
use bytes::Bytes;
use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};

/// An opaque body blob backed by `bytes::Bytes`.
///
/// Cloning is cheap (reference counted). The blob can be consumed as raw
/// bytes, as text, or as a chunk stream, so callers pick the view they
/// need instead of copying.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BodyBytes(pub Bytes);

impl BodyBytes {
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Cheaply clones the underlying `Bytes`.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks if the blob is empty or contains only ASCII whitespace.
    pub fn is_blank(&self) -> bool {
        self.is_empty() || self.0.iter().all(|&b| b.is_ascii_whitespace())
    }

    pub fn contains_str(&self, substring: &str) -> bool {
        self.contains_slice(substring.as_bytes())
    }

    pub fn contains_slice(&self, slice: &[u8]) -> bool {
        if slice.is_empty() {
            return true;
        }

        self.0
            .as_ref()
            .windows(slice.len())
            .any(|window| window == slice)
    }

    /// Converts the bytes to a UTF-8 string, potentially lossy.
    /// Tries to borrow first to avoid copying and creating an owned instance.
    pub fn text(&self) -> Cow<str> {
        match std::str::from_utf8(&self.0) {
            Ok(valid_str) => Cow::Borrowed(valid_str),
            Err(_) => Cow::Owned(String::from_utf8_lossy(&self.0).to_string()),
        }
    }

    /// Decodes the bytes as text, honoring the `charset` parameter of the
    /// given `Content-Type` value. UTF-8 and US-ASCII are decoded directly;
    /// anything else falls back to a lossy UTF-8 interpretation.
    pub fn text_with_content_type(&self, content_type: Option<&str>) -> Cow<str> {
        let charset = content_type
            .and_then(|ct| {
                ct.split(';')
                    .map(str::trim)
                    .find_map(|p| p.strip_prefix("charset="))
            })
            .map(|cs| cs.trim_matches('"').to_ascii_lowercase());

        match charset.as_deref() {
            None | Some("utf-8") | Some("utf8") | Some("us-ascii") | Some("ascii") => self.text(),
            Some(other) => {
                tracing::debug!("unsupported charset {}, decoding lossy", other);
                Cow::Owned(String::from_utf8_lossy(&self.0).to_string())
            }
        }
    }

    /// Exposes the blob as a byte stream (a single chunk, since the body
    /// has already been read off the wire).
    pub fn stream(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        stream::iter(if self.0.is_empty() {
            Vec::new()
        } else {
            vec![self.0.clone()]
        })
    }
}

impl From<Bytes> for BodyBytes {
    fn from(value: Bytes) -> Self {
        BodyBytes(value)
    }
}

impl From<Vec<u8>> for BodyBytes {
    fn from(value: Vec<u8>) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl From<&str> for BodyBytes {
    fn from(value: &str) -> Self {
        BodyBytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for BodyBytes {
    fn from(value: String) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl From<BodyBytes> for Bytes {
    fn from(value: BodyBytes) -> Self {
        value.0
    }
}

impl PartialEq for BodyBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for BodyBytes {}

impl AsRef<[u8]> for BodyBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl std::fmt::Display for BodyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(result) => write!(f, "{}", result),
            Err(_) => write!(
                f,
                "{}",
                base64::engine::general_purpose::STANDARD.encode(&self.0)
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contains_str_test() {
        let body = BodyBytes::from("hello world");

        assert_eq!(body.contains_str("hello"), true);
        assert_eq!(body.contains_str("world"), true);
        assert_eq!(body.contains_str(""), true);
        assert_eq!(body.contains_str("nope"), false);
    }

    #[test]
    fn text_with_content_type_test() {
        let body = BodyBytes::from("grüße");

        assert_eq!(
            body.text_with_content_type(Some("text/plain; charset=utf-8")),
            "grüße"
        );
        assert_eq!(body.text_with_content_type(None), "grüße");
    }

    #[test]
    fn is_blank_test() {
        assert_eq!(BodyBytes::from("").is_blank(), true);
        assert_eq!(BodyBytes::from(" \t\r\n").is_blank(), true);
        assert_eq!(BodyBytes::from(" x ").is_blank(), false);
    }
}
