//! URL-safe slug normalization for series titles.

/// Lowercases, replaces runs of non-alphanumeric characters with a single
/// `-`, and trims leading/trailing `-`. `"Attack on Titan: S1"` becomes
/// `"attack-on-titan-s1"`.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_dash = false;
    for ch in title.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_and_lowercases() {
        assert_eq!(slugify("Attack on Titan: S1"), "attack-on-titan-s1");
        assert_eq!(slugify("  Spaces  "), "spaces");
        assert_eq!(slugify("Already-Slugged"), "already-slugged");
    }
}
