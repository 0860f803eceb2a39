//! Source-line access for the hash engine.
//!
//! Line extraction follows the conventions historical report hashes were built
//! with: the file is decoded as UTF-8 with invalid bytes dropped, `\r\n` and a
//! lone `\r` both count as line terminators, and a returned line keeps a single
//! `\n` when it was terminated in the file. Changing any of this changes every
//! path-sensitive hash.

use crate::hash::DegradedReason;

/// One line read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub text: String,
    /// Set when the file contained bytes that were not valid UTF-8.
    pub had_invalid_utf8: bool,
}

/// Reads the 1-based `line` of the file at `path`.
///
/// # Errors
///
/// Returns the reason the line could not be read. Callers hash an empty line
/// in that case; the error only exists so the degradation is visible.
pub fn read_line(path: &str, line: u32) -> Result<SourceLine, DegradedReason> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DegradedReason::SourceMissing(path.to_owned()),
        _ => DegradedReason::SourceUnreadable {
            path: path.to_owned(),
            reason: e.to_string(),
        },
    })?;

    let (text, had_invalid_utf8) = decode_ignoring_invalid(&bytes);
    match nth_line(&text, line) {
        Some(text) => Ok(SourceLine {
            text,
            had_invalid_utf8,
        }),
        None => Err(DegradedReason::LineOutOfRange {
            path: path.to_owned(),
            line,
        }),
    }
}

/// Decodes `bytes` as UTF-8, silently skipping invalid sequences.
fn decode_ignoring_invalid(bytes: &[u8]) -> (String, bool) {
    let mut text = String::with_capacity(bytes.len());
    let mut had_invalid = false;
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
        had_invalid |= !chunk.invalid().is_empty();
    }
    (text, had_invalid)
}

/// Returns the 1-based `line` of `text` with universal-newline handling.
fn nth_line(text: &str, line: u32) -> Option<String> {
    if line == 0 {
        return None;
    }

    let mut rest = text;
    let mut current = 1;
    while !rest.is_empty() {
        let (body, tail, terminated) = match rest.find(|c: char| c == '\r' || c == '\n') {
            Some(i) => {
                let skip = if rest[i..].starts_with("\r\n") { 2 } else { 1 };
                (&rest[..i], &rest[i + skip..], true)
            }
            None => (rest, "", false),
        };
        if current == line {
            let mut out = body.to_owned();
            if terminated {
                out.push('\n');
            }
            return Some(out);
        }
        rest = tail;
        current += 1;
    }
    None
}

/// Strips every whitespace character from `line` and maps `old_col` onto the
/// stripped text.
///
/// The new column is `old_col` minus the number of whitespace characters among
/// the first `old_col` characters, so re-indenting a line keeps the mapped
/// column stable while inserting a token before it does not.
pub fn remove_whitespace(line: &str, old_col: u32) -> (String, u32) {
    let whitespace_before = line
        .chars()
        .take(old_col as usize)
        .filter(|c| c.is_whitespace())
        .count() as u32;
    let stripped: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    (stripped, old_col.saturating_sub(whitespace_before))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_whitespace_maps_column() {
        let (stripped, col) = remove_whitespace("    int x = 1 / 0;\n", 15);
        assert_eq!(stripped, "intx=1/0;");
        // 4 indent + 4 inner spaces precede the '/' at column 15
        assert_eq!(col, 7);
    }

    #[test]
    fn test_remove_whitespace_reindent_is_stable() {
        let (a, col_a) = remove_whitespace("  foo(bar);", 3);
        let (b, col_b) = remove_whitespace("\t\t\tfoo(bar);", 4);
        assert_eq!(a, b);
        assert_eq!(col_a, col_b);
    }

    #[test]
    fn test_remove_whitespace_column_past_end() {
        let (stripped, col) = remove_whitespace("a b", 10);
        assert_eq!(stripped, "ab");
        assert_eq!(col, 9);
    }

    #[test]
    fn test_nth_line_keeps_single_newline() {
        let text = "first\r\nsecond\rthird\nlast";
        assert_eq!(nth_line(text, 1).as_deref(), Some("first\n"));
        assert_eq!(nth_line(text, 2).as_deref(), Some("second\n"));
        assert_eq!(nth_line(text, 3).as_deref(), Some("third\n"));
        assert_eq!(nth_line(text, 4).as_deref(), Some("last"));
        assert_eq!(nth_line(text, 5), None);
        assert_eq!(nth_line(text, 0), None);
    }

    #[test]
    fn test_decode_drops_invalid_bytes() {
        let (text, had_invalid) = decode_ignoring_invalid(b"ab\xffcd");
        assert_eq!(text, "abcd");
        assert!(had_invalid);
    }
}
