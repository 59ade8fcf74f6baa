//! Hex dump formatting for binary payloads.

use std::fmt::Write as _;

const WIDTH: usize = 16;

/// Format `data` as `offset: hex bytes  ascii`, sixteen bytes per line.
#[must_use]
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(WIDTH).enumerate() {
        let encoded = hex::encode(chunk);
        let bytes: Vec<&str> = encoded
            .as_bytes()
            .chunks(2)
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        if line > 0 {
            out.push('\n');
        }
        let _ = write!(
            out,
            "{:08x}: {:<width$}  {ascii}",
            line * WIDTH,
            bytes.join(" "),
            width = WIDTH * 3 - 1
        );
    }
    out
}
