//! Topic pattern matching for pattern subscriptions.

/// Check if a topic matches a glob pattern.
///
/// Matching rules (the subset of Redis `PSUBSCRIBE` globs the RPC layer uses):
/// - `*` matches any run of characters, including none
/// - `?` matches exactly one character
/// - anything else matches itself
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let topic: Vec<char> = topic.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the topic index it was tried against
    let mut backtrack: Option<(usize, usize)> = None;

    while t < topic.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == topic[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
