//! Small helpers shared across modules.

/// Incremental UTF-8 re-framing for upstream terminal output.
///
/// WebSocket text frames must be valid UTF-8, but the upstream byte stream
/// arrives in arbitrary chunks that can split a multi-byte sequence. The
/// carry keeps the incomplete tail until the next chunk completes it and
/// skips bytes that can never form a valid sequence, so every returned frame
/// is valid and the valid payload is preserved in order.
#[derive(Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb `bytes` and return the decodable prefix, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // The prefix is known valid, lossy conversion copies it verbatim.
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete tail: carry it for the next chunk.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Parse a `"w,h[,dpi]"` window message. Returns `None` unless both
/// dimensions parse and are positive; a trailing dpi is tolerated and ignored.
pub fn parse_window(msg: &str) -> Option<(u32, u32)> {
    let mut parts = msg.split(',');
    let w: u32 = parts.next()?.trim().parse().ok()?;
    let h: u32 = parts.next()?.trim().parse().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    Some((w, h))
}

/// Parse query-supplied geometry with defaults for anything missing or
/// malformed.
pub fn geometry_or_default(
    w: Option<&str>,
    h: Option<&str>,
    dpi: Option<&str>,
    defaults: (u32, u32, u32),
) -> (u32, u32, u32) {
    let parse = |v: Option<&str>, d: u32| {
        v.and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(d)
    };
    (
        parse(w, defaults.0),
        parse(h, defaults.1),
        parse(dpi, defaults.2),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_passes_whole_chunks() {
        let mut carry = Utf8Carry::new();
        assert_eq!(carry.push(b"hello").as_deref(), Some("hello"));
    }

    #[test]
    fn carry_joins_split_multibyte() {
        // "héllo" with the é split across chunks
        let bytes = "h\u{e9}llo".as_bytes();
        let mut carry = Utf8Carry::new();
        assert_eq!(carry.push(&bytes[..2]).as_deref(), Some("h"));
        assert_eq!(carry.push(&bytes[2..]).as_deref(), Some("\u{e9}llo"));
    }

    #[test]
    fn carry_skips_invalid_bytes() {
        let mut carry = Utf8Carry::new();
        let out = carry.push(&[b'a', 0xff, 0xfe, b'b']);
        assert_eq!(out.as_deref(), Some("ab"));
    }

    #[test]
    fn carry_holds_incomplete_tail() {
        let mut carry = Utf8Carry::new();
        // First byte of a 3-byte sequence only
        assert_eq!(carry.push(&[0xe4]), None);
        assert_eq!(carry.push(&[0xbd, 0xa0]).as_deref(), Some("\u{4f60}"));
    }

    #[test]
    fn window_accepts_two_or_three_fields() {
        assert_eq!(parse_window("120,40"), Some((120, 40)));
        assert_eq!(parse_window("120,40,96"), Some((120, 40)));
    }

    #[test]
    fn window_rejects_garbage_and_zeroes() {
        assert_eq!(parse_window("hhmm"), None);
        assert_eq!(parse_window("120"), None);
        assert_eq!(parse_window("0,40"), None);
        assert_eq!(parse_window("120,0"), None);
        assert_eq!(parse_window(""), None);
    }

    #[test]
    fn geometry_falls_back_per_field() {
        let d = (1024, 768, 96);
        assert_eq!(geometry_or_default(None, None, None, d), d);
        assert_eq!(
            geometry_or_default(Some("1920"), Some("1080"), Some("120"), d),
            (1920, 1080, 120)
        );
        assert_eq!(
            geometry_or_default(Some("x"), Some("0"), Some("96"), d),
            (1024, 768, 96)
        );
    }
}
