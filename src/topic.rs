use std::fmt;

/// Binding-key matcher for topic exchanges.
///
/// Keys are `.`-separated words; `*` matches exactly one word and `#` matches
/// zero or more words.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicMatcher {
    pattern: String,
    segments: Vec<String>,
}

impl TopicMatcher {
    pub fn new(pattern: &str) -> Self {
        let segments: Vec<String> = if pattern.is_empty() {
            Vec::new()
        } else {
            pattern.split('.').map(String::from).collect()
        };

        Self {
            pattern: pattern.to_string(),
            segments,
        }
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = if routing_key.is_empty() {
            Vec::new()
        } else {
            routing_key.split('.').collect()
        };
        match_words(&self.segments, &words)
    }
}

/// Runs in `O(segments × words)`; `reachable[j]` is true when the pattern
/// segments seen so far match exactly the first `j` words.
fn match_words(pattern: &[String], words: &[&str]) -> bool {
    let mut reachable = vec![false; words.len() + 1];
    reachable[0] = true;

    for segment in pattern {
        let mut next = vec![false; words.len() + 1];
        match segment.as_str() {
            // Multi-level wildcard: any prefix already matched may absorb more words
            "#" => {
                let mut seen = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    seen |= reachable[j];
                    *slot = seen;
                }
            }
            "*" => {
                for j in 1..=words.len() {
                    next[j] = reachable[j - 1];
                }
            }
            literal => {
                for j in 1..=words.len() {
                    next[j] = reachable[j - 1] && words[j - 1] == literal;
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }

    reachable[words.len()]
}

impl fmt::Display for TopicMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_exact_match() {
        let matcher = TopicMatcher::new("images.png");
        assert!(matcher.matches("images.png"));
        assert!(!matcher.matches("images.jpg"));
        assert!(!matcher.matches("images"));
    }

    #[test]
    fn test_single_word_wildcard() {
        let matcher = TopicMatcher::new("images.*");
        assert!(matcher.matches("images.png"));
        assert!(matcher.matches("images.jpg"));
        assert!(!matcher.matches("images.png.large"));
        assert!(!matcher.matches("images"));
    }

    #[test]
    fn test_multi_word_wildcard() {
        let matcher = TopicMatcher::new("images.#");
        assert!(matcher.matches("images"));
        assert!(matcher.matches("images.png"));
        assert!(matcher.matches("images.png.large.thumbnail"));
        assert!(!matcher.matches("video.mp4"));

        assert!(TopicMatcher::new("#").matches(""));
        assert!(TopicMatcher::new("#").matches("anything.at.all"));
    }

    #[test]
    fn test_complex_pattern() {
        let matcher = TopicMatcher::new("sensors.*.temp.#");
        assert!(matcher.matches("sensors.kitchen.temp"));
        assert!(matcher.matches("sensors.lab.temp.celsius.raw"));
        assert!(!matcher.matches("sensors.temp"));
        assert!(!matcher.matches("sensors.lab.humidity"));

        let matcher = TopicMatcher::new("#.error");
        assert!(matcher.matches("error"));
        assert!(matcher.matches("app.db.error"));
        assert!(!matcher.matches("app.db.warn"));
    }

    #[test]
    fn test_repeated_multi_word_wildcards_on_long_key() {
        let key = vec!["a"; 200].join(".");
        let start = Instant::now();

        let matcher = TopicMatcher::new("#.#.#.#.#.#.#.#.z");
        assert!(!matcher.matches(&key));
        assert!(matcher.matches(&format!("{}.z", key)));

        let matcher = TopicMatcher::new("a.#.*.#.a");
        assert!(matcher.matches(&key));
        assert!(!matcher.matches("a.a"));

        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
