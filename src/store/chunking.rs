use serde::{Deserialize, Serialize};

fn default_max_chars() -> usize {
    4000
}

/// How documents are split into independently embedded chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPolicy {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

impl ChunkPolicy {
    pub fn needs_split(&self, content: &str) -> bool {
        content.len() > self.max_chars
    }
}

/// Key of the `index`-th content chunk (1-based) of a document
pub fn part_key(document: &str, index: usize) -> String {
    format!("{document} part {index}")
}

/// Key of the synthetic metadata chunk of a document
pub fn metadata_key(document: &str) -> String {
    format!("{document}::metadata")
}

/// Split text into chunks of at most `max_chars` bytes.
///
/// Cuts prefer a paragraph break, then a line break, then a space, as long as
/// the cut keeps at least half a chunk. Concatenating the chunks always yields
/// the original text.
pub fn chunk_text(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = content;

    while rest.len() > max_chars {
        let mut hard = max_chars;
        while !rest.is_char_boundary(hard) {
            hard -= 1;
        }
        if hard == 0 {
            // a single character wider than the limit
            hard = rest
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
        }

        let window = &rest[..hard];
        let floor = hard / 2;
        let cut = ["\n\n", "\n", " "]
            .iter()
            .find_map(|sep| {
                window
                    .rfind(sep)
                    .map(|pos| pos + sep.len())
                    .filter(|&end| end > floor)
            })
            .unwrap_or(hard);

        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 10), vec!["hello"]);
        assert!(chunk_text("", 10).is_empty());
    }

    #[test]
    fn chunks_respect_limit_and_rejoin() {
        let text = "alpha beta gamma delta\n\nepsilon zeta eta theta iota kappa\nlambda mu";
        let chunks = chunk_text(text, 20);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 20));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = chunk_text(&text, 40);
        assert_eq!(chunks[0], format!("{}\n\n", "a".repeat(30)));
        assert_eq!(chunks[1], "b".repeat(30));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = chunk_text(&text, 7);
        assert!(chunks.iter().all(|c| c.len() <= 7));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn key_naming() {
        assert_eq!(part_key("notes/a.md", 2), "notes/a.md part 2");
        assert_eq!(metadata_key("notes/a.md"), "notes/a.md::metadata");
        assert!(ChunkPolicy::default().needs_split(&"x".repeat(4001)));
        assert!(!ChunkPolicy::default().needs_split(&"x".repeat(4000)));
    }
}
