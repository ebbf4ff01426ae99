//! Stored-name resolution
//!
//! Names only need to be unique inside one share, so resolution is a pure
//! function of that share's current files.

use super::types::Share;

const MAX_NAME_LEN: usize = 200;

/// Assigns collision-free stored names within a share
pub struct NameResolver;

impl NameResolver {
    /// Pick a stored name for `original_name` that no file in `share` uses yet
    ///
    /// `report.pdf` becomes `report (1).pdf`, then `report (2).pdf`, and so on.
    pub fn resolve(share: &Share, original_name: &str) -> String {
        let candidate = sanitize_filename(original_name);
        let taken = |name: &str| share.files.iter().any(|f| f.stored_name == name);

        if !taken(&candidate) {
            return candidate;
        }

        let (stem, ext) = split_extension(&candidate);
        let mut counter = 1u32;
        loop {
            let name = format!("{} ({}){}", stem, counter, ext);
            if !taken(&name) {
                return name;
            }
            counter += 1;
        }
    }
}

/// Strip directory components and characters unsafe in file names
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();

    let cleaned = cleaned
        .trim_start_matches(|c: char| c == '.' || c.is_whitespace())
        .trim_end();

    if cleaned.is_empty() {
        return "file".to_string();
    }

    if cleaned.len() <= MAX_NAME_LEN {
        return cleaned.to_string();
    }

    // Keep the extension when truncating
    let (stem, ext) = split_extension(cleaned);
    let mut keep = MAX_NAME_LEN.saturating_sub(ext.len());
    while !stem.is_char_boundary(keep.min(stem.len())) {
        keep -= 1;
    }
    format!("{}{}", &stem[..keep.min(stem.len())], ext)
}

/// `("report", ".pdf")`; dotfiles and extensionless names keep an empty extension
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}
