use std::path::{Path, PathBuf};

use crate::database::Item;

const MAX_PART_CHARS: usize = 50;

/// Strip characters that are illegal in file names, turn whitespace runs into
/// `_`, and cap the length at 50 characters.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(MAX_PART_CHARS)
        .collect()
}

/// `author_title_id.mp4`
pub fn item_filename(item: &Item) -> String {
    format!(
        "{}_{}_{}.mp4",
        sanitize_filename(&item.author),
        sanitize_filename(&item.title),
        sanitize_filename(&item.id)
    )
}

/// First free path for `file_name` in `dir`, appending ` (n)` before the
/// extension when the name is taken.
pub fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() && !e.is_empty() => (s.to_string(), e.to_string()),
        _ => (file_name.to_string(), String::from("bin")),
    };
    let mut target = dir.join(format!("{stem}.{ext}"));
    let mut n = 1usize;
    while target.exists() {
        target = dir.join(format!("{stem} ({n}).{ext}"));
        n += 1;
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_strips_and_joins() {
        assert_eq!(sanitize_filename(r#"a<b>c:"d"/e\f|g?h*"#), "abcdefgh");
        assert_eq!(sanitize_filename("  hello   big\tworld "), "hello_big_world");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(80);
        assert_eq!(sanitize_filename(&long).chars().count(), 50);
    }

    #[test]
    fn test_item_filename() {
        let mut item = Item::new("7301", "u1", "my clip: part 1?", "https://x");
        item.author = "The Author".into();
        assert_eq!(item_filename(&item), "The_Author_my_clip_part_1_7301.mp4");
    }

    #[test]
    fn test_unique_path_appends_counter() {
        let dir = tempdir().unwrap();
        let first = unique_path(dir.path(), "clip.mp4");
        assert_eq!(first, dir.path().join("clip.mp4"));
        std::fs::write(&first, b"x").unwrap();

        assert_eq!(unique_path(dir.path(), "clip.mp4"), dir.path().join("clip (1).mp4"));
        std::fs::write(dir.path().join("clip (1).mp4"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "clip.mp4"), dir.path().join("clip (2).mp4"));
    }
}
