//! Small helpers shared by the structure builder and the exception dispatcher.

pub(crate) mod io;

use widestring::U16String;

/// Encodes `value` as UTF-16LE followed by a two byte NUL terminator.
///
/// Returns the encoded bytes and the byte length of the string without the terminator, which
/// is what `UNICODE_STRING::Length` records.
pub(crate) fn to_wide_nul(value: &str) -> (Vec<u8>, usize) {
    let wide = U16String::from_str(value);
    let mut bytes = Vec::with_capacity((wide.len() + 1) * 2);
    for unit in wide.as_slice() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    let length = bytes.len();
    bytes.extend_from_slice(&[0, 0]);
    (bytes, length)
}

/// Rewrites forward slashes to the backslash separator guest code expects.
pub(crate) fn to_windows_path(path: &str) -> String {
    path.replace('/', "\\")
}

/// Returns the lower-cased final component of a path, accepting either separator.
pub(crate) fn file_name_lower(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_encoding_has_terminator() {
        let (bytes, length) = to_wide_nul("ab");
        assert_eq!(bytes, vec![b'a', 0, b'b', 0, 0, 0]);
        assert_eq!(length, 4);

        let (bytes, length) = to_wide_nul("");
        assert_eq!(bytes, vec![0, 0]);
        assert_eq!(length, 0);
    }

    #[test]
    fn paths() {
        assert_eq!(to_windows_path("c:/dir/App.exe"), "c:\\dir\\App.exe");
        assert_eq!(file_name_lower("c:/dir\\KERNEL32.DLL"), "kernel32.dll");
        assert_eq!(file_name_lower("ntdll.dll"), "ntdll.dll");
    }
}
