//! Text form of IPv4 ranges
//!
//! Accepted forms, with optional whitespace between tokens:
//!
//! ```text
//! 10.0.0.1
//! 10.0.0.1-10.0.0.9
//! 192.168.1.0/24
//! 192.168.1.0/255.255.255.0
//! ```
//!
//! A line may start with one of the caller's marker characters (`-` or `+`
//! for trust lists). Blank lines and lines starting with `#`, `//` or `--`
//! are skipped. Text after the range is left for the caller, starting at
//! [`ParsedRange::pos`].

use thiserror::Error;

/// Reasons a line does not yield a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Line skipped")]
    LineSkipped,
    #[error("Invalid format")]
    BadFormat,
    #[error("Invalid network mask")]
    BadNetmask,
    #[error("Invalid range")]
    BadRange,
}

/// Parser options
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions<'a> {
    /// Characters accepted as a leading marker
    pub special_chars: &'a [u8],
}

/// A parsed range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRange {
    pub start: u32,
    pub end: u32,
    /// Byte offset just past the range text
    pub pos: usize,
    /// Leading marker character, if one was present
    pub special: Option<u8>,
}

/// Parse a range from `line`, starting at byte offset `start_pos`
pub fn parse_line(
    line: &str,
    options: &ParseOptions<'_>,
    start_pos: usize,
) -> Result<ParsedRange, ParseError> {
    let s = line.as_bytes();
    let mut i = start_pos.min(s.len());

    skip_whitespace(s, &mut i);
    if i == s.len() || s[i] == b'#' {
        return Err(ParseError::LineSkipped);
    }
    if i + 1 < s.len() && s[i + 1] == s[i] && (s[i] == b'/' || s[i] == b'-') {
        return Err(ParseError::LineSkipped);
    }

    let mut special = None;
    if options.special_chars.contains(&s[i]) {
        special = Some(s[i]);
        i += 1;
        if i == s.len() {
            return Err(ParseError::BadFormat);
        }
    }

    let mut j = i;
    skip_ip_address(s, &mut j);
    let start = parse_ipv4(&s[i..j]).ok_or(ParseError::BadFormat)?;
    i = j;
    skip_whitespace(s, &mut i);
    if i == s.len() {
        return Ok(ParsedRange {
            start,
            end: start,
            pos: i,
            special,
        });
    }

    let sep = s[i];
    i += 1;
    skip_whitespace(s, &mut i);
    if i == s.len() {
        return Err(ParseError::BadFormat);
    }

    let end = match sep {
        b'/' => {
            j = i;
            skip_digits(s, &mut j);
            let mask = if j < s.len() && s[j] == b'.' {
                j = i;
                skip_ip_address(s, &mut j);
                parse_ipv4(&s[i..j])
                    .filter(|&m| is_valid_mask(m))
                    .ok_or(ParseError::BadNetmask)?
            } else {
                let bits = parse_prefix_len(&s[i..j]).ok_or(ParseError::BadNetmask)?;
                u32::MAX << (32 - bits)
            };
            start | !mask
        }
        b'-' => {
            j = i;
            skip_ip_address(s, &mut j);
            parse_ipv4(&s[i..j]).ok_or(ParseError::BadFormat)?
        }
        // Anything else is trailing text after a single address
        _ => start,
    };

    if end < start {
        return Err(ParseError::BadRange);
    }
    Ok(ParsedRange {
        start,
        end,
        pos: j,
        special,
    })
}

/// Parse a line with no marker characters from its beginning
pub fn parse_range(line: &str) -> Result<ParsedRange, ParseError> {
    parse_line(line, &ParseOptions::default(), 0)
}

/// A netmask is a non-empty run of set bits from the top
pub const fn is_valid_mask(mask: u32) -> bool {
    if mask == 0 {
        return false;
    }
    let inv = !mask;
    inv & inv.wrapping_add(1) == 0
}

/// Strict dotted-quad IPv4 address, host byte order
pub fn parse_ipv4(s: &[u8]) -> Option<u32> {
    let mut result = 0u32;
    let mut parts = 0;
    for part in s.split(|&b| b == b'.') {
        if part.is_empty() || part.len() > 3 || !part.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let octet = part
            .iter()
            .fold(0u32, |acc, &d| acc * 10 + u32::from(d - b'0'));
        if octet > 255 {
            return None;
        }
        result = (result << 8) | octet;
        parts += 1;
    }
    (parts == 4).then_some(result)
}

fn parse_prefix_len(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 2 {
        return None;
    }
    let bits = digits
        .iter()
        .fold(0u32, |acc, &d| acc * 10 + u32::from(d - b'0'));
    (1..=32).contains(&bits).then_some(bits)
}

fn skip_whitespace(s: &[u8], i: &mut usize) {
    while *i < s.len() && (s[*i] == b' ' || s[*i] == b'\t') {
        *i += 1;
    }
}

fn skip_ip_address(s: &[u8], i: &mut usize) {
    while *i < s.len() && (s[*i].is_ascii_digit() || s[*i] == b'.') {
        *i += 1;
    }
}

fn skip_digits(s: &[u8], i: &mut usize) {
    while *i < s.len() && s[*i].is_ascii_digit() {
        *i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_single_address() {
        let r = parse_range("10.0.0.5").unwrap();
        assert_eq!((r.start, r.end), (ip("10.0.0.5"), ip("10.0.0.5")));
        assert_eq!(r.pos, 8);
        assert_eq!(r.special, None);
    }

    #[test]
    fn test_cidr() {
        let r = parse_range("192.168.1.0/24").unwrap();
        assert_eq!(r.start, ip("192.168.1.0"));
        assert_eq!(r.end, ip("192.168.1.255"));

        let r = parse_range("10.1.2.3/32").unwrap();
        assert_eq!(r.end, r.start);
        let r = parse_range("0.0.0.0/1").unwrap();
        assert_eq!(r.end, ip("127.255.255.255"));
    }

    #[test]
    fn test_dotted_mask() {
        let r = parse_range("172.16.0.0/255.240.0.0").unwrap();
        assert_eq!(r.end, ip("172.31.255.255"));

        assert_eq!(
            parse_range("172.16.0.0/255.0.255.0"),
            Err(ParseError::BadNetmask)
        );
        assert_eq!(parse_range("172.16.0.0/0.0.0.0"), Err(ParseError::BadNetmask));
    }

    #[test]
    fn test_bad_prefix_length() {
        assert_eq!(parse_range("10.0.0.0/0"), Err(ParseError::BadNetmask));
        assert_eq!(parse_range("10.0.0.0/33"), Err(ParseError::BadNetmask));
        assert_eq!(parse_range("10.0.0.0/x"), Err(ParseError::BadNetmask));
    }

    #[test]
    fn test_explicit_range() {
        let r = parse_range("10.0.0.5-10.0.0.9").unwrap();
        assert_eq!((r.start, r.end), (ip("10.0.0.5"), ip("10.0.0.9")));

        let r = parse_range("  10.0.0.5 - 10.0.0.9 blocked").unwrap();
        assert_eq!(r.end, ip("10.0.0.9"));
        assert_eq!(&"  10.0.0.5 - 10.0.0.9 blocked"[r.pos..], " blocked");

        assert_eq!(
            parse_range("10.0.0.9-10.0.0.5"),
            Err(ParseError::BadRange)
        );
    }

    #[test]
    fn test_skipped_lines() {
        for line in ["", "   ", "# comment", "  #", "// c++ style", "-- sql style"] {
            assert_eq!(parse_range(line), Err(ParseError::LineSkipped), "{line:?}");
        }
    }

    #[test]
    fn test_bad_format() {
        assert_eq!(parse_range("hello"), Err(ParseError::BadFormat));
        assert_eq!(parse_range("10.0.0"), Err(ParseError::BadFormat));
        assert_eq!(parse_range("10.0.0.256"), Err(ParseError::BadFormat));
        assert_eq!(parse_range("10.0.0.1-"), Err(ParseError::BadFormat));
        assert_eq!(parse_range("10.0.0.1 - x"), Err(ParseError::BadFormat));
    }

    #[test]
    fn test_trailing_text_position() {
        let line = "1.2.3.4 Some note";
        let r = parse_range(line).unwrap();
        assert_eq!(r.start, r.end);
        assert_eq!(&line[r.pos..], " Some note");

        let line = "1.2.3.0/24 Office";
        let r = parse_range(line).unwrap();
        assert_eq!(&line[r.pos..], " Office");
    }

    #[test]
    fn test_special_chars() {
        let options = ParseOptions {
            special_chars: b"-+",
        };
        let r = parse_line("-1.2.3.4", &options, 0).unwrap();
        assert_eq!(r.special, Some(b'-'));
        assert_eq!(r.start, ip("1.2.3.4"));

        let r = parse_line("+5.6.7.0/24", &options, 0).unwrap();
        assert_eq!(r.special, Some(b'+'));
        assert_eq!(r.end, ip("5.6.7.255"));

        assert_eq!(parse_line("+", &options, 0), Err(ParseError::BadFormat));
        assert_eq!(parse_line("+ 1.2.3.4", &options, 0), Err(ParseError::BadFormat));
        // Still a comment with markers enabled
        assert_eq!(parse_line("--", &options, 0), Err(ParseError::LineSkipped));
        // Without markers a leading sign is just bad input
        assert_eq!(parse_range("+1.2.3.4"), Err(ParseError::BadFormat));
    }

    #[test]
    fn test_start_pos() {
        let line = "Bad people:1.2.3.0-1.2.3.9";
        let colon = line.rfind(':').unwrap();
        let r = parse_line(line, &ParseOptions::default(), colon + 1).unwrap();
        assert_eq!(r.start, ip("1.2.3.0"));
        assert_eq!(r.end, ip("1.2.3.9"));
        assert_eq!(r.pos, line.len());
    }

    #[test]
    fn test_mask_validity() {
        assert!(is_valid_mask(0xFFFF_FF00));
        assert!(is_valid_mask(u32::MAX));
        assert!(is_valid_mask(0x8000_0000));
        assert!(!is_valid_mask(0));
        assert!(!is_valid_mask(0xFF00_FF00));
        assert!(!is_valid_mask(0x0000_00FF));
    }

    #[test]
    fn test_error_text() {
        assert_eq!(ParseError::BadRange.to_string(), "Invalid range");
        assert_eq!(ParseError::BadFormat.to_string(), "Invalid format");
        assert_eq!(ParseError::BadNetmask.to_string(), "Invalid network mask");
    }
}
