//! The chunked MSZIP decoder used by the WinGet manifest fetcher (C10) to
//! decompress `versionData.mszyml`.
//!
//! Each chunk begins with magic `00 00 43 4B` followed by a raw DEFLATE
//! stream; there is no chunk-size framing, so decoding proceeds until a
//! chunk fails to decode or the input is exhausted.

use crate::Error;
use flate2::read::DeflateDecoder;
use std::io::Read as _;

const MAGIC: &[u8; 4] = b"\x00\x00\x43\x4B";
const MAGIC_OFFSET: usize = 26;

/// Decodes an MSZIP stream into its concatenated raw bytes.
///
/// Verifies the magic at offset 26 per spec.md §4.10, then repeatedly
/// consumes a 4-byte chunk magic followed by a raw DEFLATE segment,
/// stopping at the first decode failure or end of input.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, Error> {
    if input.len() < MAGIC_OFFSET + MAGIC.len() || &input[MAGIC_OFFSET..MAGIC_OFFSET + 4] != MAGIC {
        return Err(Error::decode(
            "mszip stream",
            "magic 00 00 43 4B not found at offset 26",
        ));
    }

    let mut output = Vec::new();
    let mut pos = MAGIC_OFFSET;

    while pos + 4 <= input.len() {
        if &input[pos..pos + 4] != MAGIC {
            break;
        }
        pos += 4;

        let remaining = &input[pos..];
        let mut decoder = DeflateDecoder::new(remaining);
        let mut chunk = Vec::new();
        let read = decoder.read_to_end(&mut chunk);

        match read {
            Ok(_) => {
                output.extend_from_slice(&chunk);
                pos += decoder.total_in() as usize;
            }
            Err(_) if !chunk.is_empty() => {
                // Partial tail: keep what decoded before the failure and
                // stop, matching "on end-of-stream or decode error, break".
                output.extend_from_slice(&chunk);
                break;
            }
            Err(_) => break,
        }
    }

    Ok(strip_invalid_lines(&output))
}

/// Strips any line containing bytes outside `{TAB, LF, CR, printable ASCII,
/// U+00A0..U+FFFF}`, matching spec.md §4.10's description of partial-tail
/// artifacts left by the chunked decode.
fn strip_invalid_lines(bytes: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(text.len());

    for line in text.split_inclusive('\n') {
        if line.chars().all(is_allowed_char) {
            out.push_str(line);
        }
    }

    out.into_bytes()
}

fn is_allowed_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r')
        || (' '..='~').contains(&c)
        || ('\u{00A0}'..='\u{FFFF}').contains(&c)
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    fn build_fixture(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0u8; MAGIC_OFFSET];
        for chunk in chunks {
            out.extend_from_slice(MAGIC);
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(chunk).unwrap();
            out.extend_from_slice(&encoder.finish().unwrap());
        }
        out
    }

    #[test]
    fn rejects_missing_magic() {
        let input = vec![0u8; 40];
        assert!(decode(&input).is_err());
    }

    #[test]
    fn decodes_single_chunk() {
        let fixture = build_fixture(&[b"vD:\n- v: \"1.0\"\n  rP: manifests/a/1.0/a.yaml\n"]);
        let decoded = decode(&fixture).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "vD:\n- v: \"1.0\"\n  rP: manifests/a/1.0/a.yaml\n"
        );
    }

    #[test]
    fn concatenates_multiple_chunks() {
        let fixture = build_fixture(&[b"first\n", b"second\n"]);
        let decoded = decode(&fixture).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn strips_lines_with_disallowed_bytes() {
        let mut bytes = b"good line\n".to_vec();
        bytes.push(0x01);
        bytes.extend_from_slice(b"\nanother good line\n");
        let stripped = strip_invalid_lines(&bytes);
        let text = String::from_utf8(stripped).unwrap();
        assert!(text.contains("good line"));
        assert!(text.contains("another good line"));
    }
}
