//! Input sanitization for filenames and folder names.

use crate::{Result, StrataError};

/// Maximum length for a sanitized filename or folder name.
pub const MAX_NAME_LENGTH: usize = 255;

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Encoded sequences that indicate a traversal or injection attempt.
///
/// Matched case-insensitively against the raw input before any rewriting.
const REJECTED_SEQUENCES: &[&str] = &["..", "%2e%2e", "%2f", "%5c", "%00"];

/// Sanitize a client-supplied filename.
///
/// Rejects traversal attempts outright; takes the basename of whatever
/// path the client sent; rewrites characters that are unsafe on common
/// filesystems to `_`; trims; caps the length at [`MAX_NAME_LENGTH`]. The
/// result is stable: sanitizing a sanitized name returns it unchanged.
pub fn sanitize_filename(input: &str) -> Result<String> {
    if input.is_empty() {
        return Err(StrataError::Validation("filename must not be empty".into()));
    }
    if input.contains('\0') {
        return Err(StrataError::Validation(
            "filename contains a null byte".into(),
        ));
    }

    let lowered = input.to_lowercase();
    for seq in REJECTED_SEQUENCES {
        if lowered.contains(seq) {
            return Err(StrataError::Validation(format!(
                "filename contains forbidden sequence {seq:?}"
            )));
        }
    }

    // Basename first, on the raw separators: clients may send full paths.
    let base = input.rsplit(['/', '\\']).next().unwrap_or(input);

    let replaced: String = base
        .chars()
        .map(|c| {
            if c.is_control() || FORBIDDEN.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim();

    if trimmed.is_empty() || trimmed == "." {
        return Err(StrataError::Validation(
            "filename is empty after sanitization".into(),
        ));
    }

    Ok(truncate_chars(trimmed, MAX_NAME_LENGTH))
}

/// Sanitize a folder name.
///
/// Same character policy as filenames but without traversal rejection:
/// unsafe characters are stripped rather than kept, matching how folder
/// names are displayed in paths.
pub fn sanitize_folder_name(input: &str) -> Result<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN.contains(c))
        .collect();
    let trimmed = cleaned.trim();

    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(StrataError::Validation("folder name is empty".into()));
    }

    Ok(truncate_chars(trimmed, MAX_NAME_LENGTH))
}

/// Extract the dotted extension of a filename, empty when there is none.
///
/// `"photo.JPG"` yields `".JPG"`; `"README"` and `".hidden"` yield `""`.
pub fn file_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx < name.len() - 1 => name[idx..].to_string(),
        _ => String::new(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name_passes() {
        assert_eq!(sanitize_filename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("a b c.txt").unwrap(), "a b c.txt");
    }

    #[test]
    fn test_forbidden_chars_replaced() {
        assert_eq!(
            sanitize_filename("a<b>c:d\"e|f?g*h.txt").unwrap(),
            "a_b_c_d_e_f_g_h.txt"
        );
    }

    #[test]
    fn test_control_chars_replaced() {
        assert_eq!(sanitize_filename("a\tb\rc.txt").unwrap(), "a_b_c.txt");
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(sanitize_filename("../etc/passwd").is_err());
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("a%2e%2eb").is_err());
        assert!(sanitize_filename("a%2E%2Eb").is_err());
        assert!(sanitize_filename("a%2Fb").is_err());
        assert!(sanitize_filename("a%5cb").is_err());
        assert!(sanitize_filename("a%00b").is_err());
    }

    #[test]
    fn test_null_byte_rejected() {
        assert!(sanitize_filename("a\0b").is_err());
    }

    #[test]
    fn test_empty_rejected() {
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("   ").is_err());
        assert!(sanitize_filename(".").is_err());
    }

    #[test]
    fn test_basename_extracted() {
        assert_eq!(sanitize_filename("dir/name.txt").unwrap(), "name.txt");
        assert_eq!(sanitize_filename("dir\\name.txt").unwrap(), "name.txt");
        assert_eq!(
            sanitize_filename("C:\\Users\\me\\photo.png").unwrap(),
            "photo.png"
        );
        // A trailing separator leaves nothing to keep.
        assert!(sanitize_filename("dir/").is_err());
    }

    #[test]
    fn test_length_cap() {
        let long = "x".repeat(400) + ".txt";
        let out = sanitize_filename(&long).unwrap();
        assert_eq!(out.chars().count(), MAX_NAME_LENGTH);
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "report.pdf",
            "a<b>c.txt",
            "  padded .bin ",
            "日本語ファイル.txt",
            "x|y?z*.dat",
        ];
        for input in inputs {
            let once = sanitize_filename(input).unwrap();
            let twice = sanitize_filename(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_unicode_preserved() {
        assert_eq!(
            sanitize_filename("日本語ファイル.txt").unwrap(),
            "日本語ファイル.txt"
        );
    }

    #[test]
    fn test_folder_name_strips() {
        assert_eq!(sanitize_folder_name("my<folder>").unwrap(), "myfolder");
        assert_eq!(sanitize_folder_name("  docs  ").unwrap(), "docs");
        assert!(sanitize_folder_name("<>:").is_err());
        assert!(sanitize_folder_name("..").is_err());
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("photo.JPG"), ".JPG");
        assert_eq!(file_extension("archive.tar.gz"), ".gz");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension(".hidden"), "");
        assert_eq!(file_extension("dot."), "");
    }
}
