//! Safe filename generation utilities

/// Longest title portion kept in a filename, in bytes
const MAX_TITLE_LEN: usize = 200;

fn is_invalid_char(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
}

/// Convert a title to a safe filename by replacing invalid characters
pub fn to_safe_filename(title: &str, extension: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| if is_invalid_char(c) { '_' } else { c })
        .collect();

    // Remove leading/trailing dots and spaces
    let mut safe_title = replaced
        .trim_matches(|c: char| c == '.' || c == ' ')
        .to_string();

    if safe_title.len() > MAX_TITLE_LEN {
        let mut cut = MAX_TITLE_LEN;
        while !safe_title.is_char_boundary(cut) {
            cut -= 1;
        }
        safe_title.truncate(cut);
        safe_title = safe_title.trim_end().to_string();
    }

    if safe_title.is_empty() {
        safe_title = "video".to_string();
    }

    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
        safe_title
    } else {
        format!("{}.{}", safe_title, extension)
    }
}

/// Archive name `{channel}-ep{00000}-{title}.{ext}`
pub fn canonical_filename(channel: &str, episode: u32, title: &str, extension: &str) -> String {
    let stem = format!("{}-ep{:05}-{}", channel.trim(), episode, title.trim());
    to_safe_filename(&stem, extension)
}
