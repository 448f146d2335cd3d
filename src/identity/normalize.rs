/// Name normalization for organizational unit matching

/// Apostrophe-like characters the remote system uses interchangeably
const APOSTROPHES: [char; 6] = ['\u{2018}', '\u{2019}', '\u{02BB}', '\u{02BC}', '`', '\u{00B4}'];

/// Trim, case-fold, unify apostrophes and collapse whitespace
pub fn normalize(raw: &str) -> String {
    let unified: String = raw
        .chars()
        .map(|c| if APOSTROPHES.contains(&c) { '\'' } else { c })
        .collect();

    unified
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Remove modifier qualifiers from an already normalized name.
///
/// Parenthesized groups are dropped when their content starts with a modifier word,
/// as are bare trailing modifier words, e.g. `"25-23 axborot (kunduzgi) (o'zbek)"`
/// and `"25-23 axborot kunduzgi"` both strip to `"25-23 axborot"`.
pub fn strip_modifiers<'a>(normalized: &str, modifiers: impl Iterator<Item = &'a str> + Clone) -> String {
    let is_modifier = |word: &str| {
        let word = word.trim_matches(|c: char| c == ',' || c == '-' || c.is_whitespace());
        !word.is_empty() && modifiers.clone().any(|m| word.starts_with(m))
    };

    // Drop parenthesized modifier groups
    let mut out = String::with_capacity(normalized.len());
    let mut rest = normalized;
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')').map(|i| open + i) else {
            break;
        };
        out.push_str(&rest[..open]);
        let inner = &rest[open + 1..close];
        if !is_modifier(inner) {
            out.push_str(&rest[open..=close]);
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);

    // Drop trailing bare modifiers
    let mut words: Vec<&str> = out.split_whitespace().collect();
    while words.len() > 1 && words.last().map_or(false, |w| is_modifier(w)) {
        words.pop();
    }

    words.join(" ")
}
