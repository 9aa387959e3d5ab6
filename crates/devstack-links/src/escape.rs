//! Stable-name escaping for claim index directory names.
//!
//! A stable name is a path; the claim index needs it as a single
//! filename. `/` becomes the literal four bytes `\x2f` and `\` becomes
//! `\x5c`; nothing else is rewritten. This encoding is the on-disk
//! contract of the index and must not change without a coordinated
//! migration.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

/// Buffer size used by [`escape_path_os`], matching `PATH_MAX`. Worst
/// case expansion is 4x, so only pathologically long names overflow.
pub const ESCAPED_NAME_MAX: usize = 4096;

/// Escape `src` into the caller-provided buffer.
///
/// The output is NUL-terminated; the returned length excludes the
/// terminator. If appending the next token would not leave room for the
/// terminator, the output is reset to an empty NUL-terminated string and
/// the length is 0. That degraded result is still a usable, if
/// collision-prone, directory name; existing indexes depend on this
/// exact behavior.
pub fn escape_path(src: &[u8], dest: &mut [u8]) -> usize {
    if dest.is_empty() {
        return 0;
    }

    let mut j = 0;
    for &b in src {
        let token: &[u8] = match b {
            b'/' => b"\\x2f",
            b'\\' => b"\\x5c",
            _ => std::slice::from_ref(&b),
        };
        if j + token.len() >= dest.len() {
            j = 0;
            break;
        }
        dest[j..j + token.len()].copy_from_slice(token);
        j += token.len();
    }
    dest[j] = 0;
    j
}

/// Escape a path using a `PATH_MAX`-sized buffer.
pub fn escape_path_os(path: &Path) -> OsString {
    let mut buf = [0u8; ESCAPED_NAME_MAX];
    let n = escape_path(path.as_os_str().as_bytes(), &mut buf);
    OsString::from_vec(buf[..n].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escape_to_string(src: &[u8], size: usize) -> (Vec<u8>, usize) {
        let mut buf = vec![0u8; size];
        let n = escape_path(src, &mut buf);
        assert_eq!(buf[n], 0);
        (buf[..n].to_vec(), n)
    }

    #[test]
    fn slashes_and_backslashes_are_rewritten() {
        let (out, n) = escape_to_string(b"/disk/by-id/X", 128);
        assert_eq!(out, b"\\x2fdisk\\x2fby-id\\x2fX");
        assert_eq!(n, out.len());

        let (out, _) = escape_to_string(b"a\\b", 128);
        assert_eq!(out, b"a\\x5cb");
    }

    #[test]
    fn other_bytes_pass_verbatim() {
        let (out, n) = escape_to_string(b"ttyUSB0 \xc3\xa9", 128);
        assert_eq!(out, b"ttyUSB0 \xc3\xa9");
        assert_eq!(n, 10);
    }

    #[test]
    fn overflow_resets_to_empty() {
        // "/x" escapes to 5 bytes; a 5-byte buffer leaves no room for
        // the NUL after the trailing 'x'.
        let (out, n) = escape_to_string(b"/x", 5);
        assert_eq!(n, 0);
        assert!(out.is_empty());

        // One more byte fits exactly.
        let (out, n) = escape_to_string(b"/x", 6);
        assert_eq!(out, b"\\x2fx");
        assert_eq!(n, 5);
    }

    #[test]
    fn overflow_mid_string_discards_partial_output() {
        let (_, n) = escape_to_string(b"abcdef/ghi", 8);
        assert_eq!(n, 0);
    }

    #[test]
    fn escaping_is_injective_when_it_fits() {
        let inputs: &[&[u8]] = &[b"/a/b", b"/a\\b", b"\\x2fa/b", b"/a/b/", b"ab"];
        let mut seen = std::collections::HashSet::new();
        for src in inputs {
            let (out, _) = escape_to_string(src, 256);
            assert!(seen.insert(out), "collision for {:?}", src);
        }
    }

    #[test]
    fn os_wrapper_matches_raw_escape() {
        let escaped = escape_path_os(Path::new("/disk/by-id/X"));
        assert_eq!(escaped.as_bytes(), b"\\x2fdisk\\x2fby-id\\x2fX");
    }
}
