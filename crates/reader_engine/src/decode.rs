use chardetng::EncodingDetector;
use encoding_rs::Encoding;

use engine_logging::engine_debug;

/// Decode raw bytes into UTF-8 using: BOM -> Content-Type charset -> chardetng fallback.
///
/// Decoding is lossy: malformed sequences become U+FFFD rather than failing
/// the fetch.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = pick_encoding(bytes, content_type);
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        engine_debug!("lossy decode with {}", encoding.name());
    }
    text.into_owned()
}

/// Name of the encoding [`decode_body`] would use.
pub fn detect_encoding(bytes: &[u8], content_type: Option<&str>) -> &'static str {
    pick_encoding(bytes, content_type).name()
}

fn pick_encoding(bytes: &[u8], content_type: Option<&str>) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding;
    }

    if let Some(encoding) = content_type
        .and_then(extract_charset)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        return encoding;
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

fn extract_charset(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim_matches([' ', '"', '\''].as_ref()).to_string())
        })
        .next()
}
