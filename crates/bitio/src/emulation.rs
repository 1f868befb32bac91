//! Start-code emulation prevention.
//!
//! Whenever two consecutive `0x00` bytes would be followed by a byte
//! `<= 0x03`, a `0x03` byte is inserted between them, and a single `0x80`
//! stop byte is appended. [`rbsp_unescape`] is the exact inverse, dropping
//! the stop byte.

/// Escapes `src` into an RBSP with a trailing stop byte.
pub fn rbsp_escape(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 64 + 1);

    let mut zeros = 0u32;
    for &b in src {
        if zeros == 2 && b <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }

        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }

        out.push(b);
    }

    out.push(0x80);
    out
}

/// Removes emulation prevention bytes from `src` and drops the final stop
/// byte. Returns `None` when `src` is empty.
pub fn rbsp_unescape(src: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());

    let mut zeros = 0u32;
    for &b in src {
        if zeros == 2 && b == 0x03 {
            zeros = 0;
            continue;
        }

        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }

        out.push(b);
    }

    // The stop byte was added during encapsulation and is not payload.
    out.pop()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::{rbsp_escape, rbsp_unescape};

    #[test]
    fn inserts_emulation_prevention() {
        assert_eq!(rbsp_escape(&[0x00, 0x00, 0x01]), vec![0x00, 0x00, 0x03, 0x01, 0x80]);
        assert_eq!(rbsp_escape(&[0x00, 0x00, 0x03]), vec![0x00, 0x00, 0x03, 0x03, 0x80]);
        // A byte above 0x03 does not need escaping.
        assert_eq!(rbsp_escape(&[0x00, 0x00, 0x04]), vec![0x00, 0x00, 0x04, 0x80]);
    }

    #[test]
    fn zero_run_resets_after_escape() {
        // Four zeros: escape fires after the first pair; the stop byte
        // itself never needs one.
        assert_eq!(
            rbsp_escape(&[0x00, 0x00, 0x00, 0x00]),
            vec![0x00, 0x00, 0x03, 0x00, 0x00, 0x80]
        );
    }

    #[test]
    fn round_trips() {
        let cases: &[&[u8]] = &[
            &[],
            &[0x00],
            &[0x00, 0x00],
            &[0x00, 0x00, 0x00, 0x01, 0x02],
            &[0xff, 0x00, 0x00, 0x03, 0x00, 0x00],
            &[0x00, 0x00, 0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x03],
        ];
        for &case in cases {
            assert_eq!(rbsp_unescape(&rbsp_escape(case)).unwrap().as_slice(), case);
        }
    }

    #[test]
    fn unescape_of_empty_is_none() {
        assert!(rbsp_unescape(&[]).is_none());
    }
}
