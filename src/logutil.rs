//! Logging helpers that keep packet dumps and node names on a single log line.

use std::fmt::Write;

/// Render bytes as space-separated hex, truncated after `max` bytes with an
/// ellipsis and the total length so oversized payloads don't flood the log.
pub fn hex_dump(data: &[u8], max: usize) -> String {
    let shown = data.len().min(max);
    let mut out = String::with_capacity(shown * 3 + 16);
    for (i, b) in data.iter().take(shown).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > shown {
        let _ = write!(&mut out, " … ({} bytes)", data.len());
    }
    out
}

/// Escape control characters in a remote-supplied string (node names arrive
/// over the air and may contain anything).
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 64;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_truncates_long_payloads() {
        assert_eq!(hex_dump(&[0x01, 0xab, 0xff], 16), "01 ab ff");
        let long = [0u8; 40];
        let s = hex_dump(&long, 4);
        assert!(s.starts_with("00 00 00 00 …"));
        assert!(s.ends_with("(40 bytes)"));
    }

    #[test]
    fn escapes_control_chars_in_names() {
        assert_eq!(escape_log("relay\n\x07"), "relay\\n\\x07");
    }
}
