//! Guidance messages and name suggestions.
//!
//! Guidance text is a fixed four-line layout so that callers can both show it
//! to users and parse it back (the mutation gate lifts the "What happened" and
//! "Fix" lines out of evaluation errors).

const WHAT: &str = "What happened:";
const WHY: &str = "Why:";
const FIX: &str = "Fix:";
const EXAMPLE: &str = "Example:";

pub fn build_guidance_message(what: &str, why: &str, fix: &str, example: &str) -> String {
    format!(
        "{} {}\n{} {}\n{} {}\n{} {}",
        WHAT, what, WHY, why, FIX, fix, EXAMPLE, example
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuidanceParts {
    pub what: Option<String>,
    pub why: Option<String>,
    pub fix: Option<String>,
    pub example: Option<String>,
}

pub fn parse_guidance_message(message: &str) -> GuidanceParts {
    let mut parts = GuidanceParts::default();
    for raw in message.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix(WHAT) {
            parts.what = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(WHY) {
            parts.why = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(FIX) {
            parts.fix = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(EXAMPLE) {
            parts.example = Some(rest.trim().to_string());
        }
    }
    parts
}

/// First non-empty line of a message.
pub fn first_line(message: &str) -> Option<String> {
    message
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}

/// Return the best candidate whose similarity ratio with `target` is at least
/// `cutoff`. Ratio is `1 - distance / max_len`.
pub fn closest_match<'a, I>(target: &str, candidates: I, cutoff: f64) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut best: Option<(f64, &String)> = None;
    for candidate in candidates {
        let ratio = similarity_ratio(target, candidate);
        if ratio < cutoff {
            continue;
        }
        match best {
            Some((best_ratio, _)) if best_ratio >= ratio => {}
            _ => best = Some((ratio, candidate)),
        }
    }
    best.map(|(_, name)| name.clone())
}

pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / max_len as f64
}

/// Calculate Levenshtein distance between two strings
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0; b_chars.len() + 1];
    for (i, ca) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (previous[j + 1] + 1) // deletion
                .min(current[j] + 1) // insertion
                .min(previous[j] + cost); // substitution
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b_chars.len()]
}
