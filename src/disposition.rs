//! Download filenames and `Content-Disposition` values
//!
//! Browsers disagree on how to decode the `filename` parameter, so plain
//! ASCII names are quoted (with `"` escaped) and everything else goes
//! through the RFC 5987 `filename*` form. Control characters never reach
//! the quoted form, so a name cannot break the header line.
//!
//! ```text
//! report.zip       -> attachment; filename="report.zip"
//! say "hi".zip     -> attachment; filename="say \"hi\".zip"
//! 50%.zip          -> attachment; filename*=UTF-8''50%25.zip
//! Übersicht.tar.gz -> attachment; filename*=UTF-8''%C3%9Cbersicht.tar.gz
//! ```

use crate::types::ArchiveKind;
use crate::utils::parent_and_name;

/// Characters that force the extended form even in ASCII names
const SPECIAL: [char; 3] = [';', '%', '\\'];

/// Download filename for a restore of `path`
///
/// The final path segment plus the archive extension; the repository root
/// (`""`) is named after the repository.
///
/// # Examples
///
/// ```rust
/// use rewind::disposition::archive_filename;
/// use rewind::types::ArchiveKind;
///
/// assert_eq!(archive_filename("docs/report.txt", "laptop", ArchiveKind::Zip), "report.txt.zip");
/// assert_eq!(archive_filename("", "laptop", ArchiveKind::TarGz), "laptop.tar.gz");
/// ```
pub fn archive_filename(path: &str, repository_name: &str, kind: ArchiveKind) -> String {
    let (_, name) = parent_and_name(path.trim_matches('/'));
    let stem = if name.is_empty() { repository_name } else { name };
    format!("{}.{}", stem, kind.extension())
}

/// `Content-Disposition` header value for a download
pub fn content_disposition(filename: &str) -> String {
    let quotable = filename
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && !SPECIAL.contains(&c));
    if quotable {
        return format!("attachment; filename=\"{}\"", filename.replace('"', "\\\""));
    }
    format!("attachment; filename*=UTF-8''{}", percent_encode(filename))
}

/// Percent-encode UTF-8 bytes, keeping unreserved characters and `?`
fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' | b'?' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
