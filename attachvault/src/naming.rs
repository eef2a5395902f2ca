//! naming.rs — attachment naming convention (spec §6): `{name}.part{nnn}of{NNN}`,
//! zero-padded to the width of `NNN`, used by the URL resolver to re-bind
//! parts by filename after URL expiry.
use std::path::Path;

pub fn sanitize_name(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let lower = stem.to_lowercase();
    let filtered: String = lower
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == ' ')
        .collect();
    let dashed = filtered.trim().replace(' ', "-");
    let mut result = String::new();
    let mut last_dash = false;
    for ch in dashed.chars() {
        if ch == '-' {
            if !last_dash {
                result.push('-');
            }
            last_dash = true;
        } else {
            result.push(ch);
            last_dash = false;
        }
    }
    let trimmed = result.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.chars().take(100).collect()
    }
}

/// Builds the attachment filename for part `part_number` of `total_parts`.
pub fn part_attachment_name(original_name: &str, part_number: u32, total_parts: u32) -> String {
    let width = total_parts.to_string().len();
    format!(
        "{original_name}.part{:0width$}of{total_parts}",
        part_number,
        width = width
    )
}

/// Extracts `(part_number, total_parts)` from an attachment name built by
/// [`part_attachment_name`], tolerating it being the final path segment of a
/// full URL.
pub fn parse_part_suffix(attachment_name: &str) -> Option<(u32, u32)> {
    let name = attachment_name.rsplit('/').next().unwrap_or(attachment_name);
    let idx = name.rfind(".part")?;
    let rest = &name[idx + 5..];
    let of_idx = rest.find("of")?;
    let part_number: u32 = rest[..of_idx].parse().ok()?;
    let total_parts: u32 = rest[of_idx + 2..].parse().ok()?;
    Some((part_number, total_parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_part_suffix() {
        let name = part_attachment_name("movie.mp4", 3, 120);
        assert_eq!(name, "movie.mp4.part003of120");
        assert_eq!(parse_part_suffix(&name), Some((3, 120)));
    }

    #[test]
    fn parses_suffix_from_full_url() {
        let url = "https://cdn.example.com/attachments/1/2/movie.mp4.part007of120";
        assert_eq!(parse_part_suffix(url), Some((7, 120)));
    }

    #[test]
    fn sanitize_collapses_whitespace_and_case() {
        assert_eq!(sanitize_name("My  Video FILE.mp4"), "my-video-file");
    }
}
