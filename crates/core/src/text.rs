//! Small text helpers shared by retrieval, reflection, and reply
//! classification. All of them are deterministic and allocation-light;
//! none attempt real linguistic analysis.

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "does", "for", "from",
    "how", "i", "if", "in", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our",
    "please", "so", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "to", "us", "was", "we", "were", "what", "when", "where", "which", "who", "why", "will",
    "with", "would", "you", "your",
];

/// Lowercased alphanumeric tokens, in input order.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Tokens that carry meaning for matching: everything minus stopwords.
pub fn content_words(text: &str) -> Vec<String> {
    tokenize(text).into_iter().filter(|token| !STOPWORDS.contains(&token.as_str())).collect()
}

/// Naive sentence segmentation on terminal punctuation. Good enough
/// for per-sentence claim checks over model output.
pub fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Canonical form for short confirmation replies: lowercased, trimmed,
/// terminal punctuation stripped, inner whitespace collapsed.
pub fn normalize_reply(text: &str) -> String {
    let trimmed = text.trim().trim_end_matches(['.', '!', '?', ',', ';', ':']).to_lowercase();
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::{content_words, normalize_reply, sentences, tokenize};

    #[test]
    fn tokenize_splits_on_punctuation_and_lowercases() {
        assert_eq!(tokenize("What's our Refund-Policy?"), vec!["what", "s", "our", "refund", "policy"]);
    }

    #[test]
    fn content_words_drop_stopwords() {
        assert_eq!(content_words("What is the refund policy?"), vec!["refund", "policy"]);
    }

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        let split = sentences("Refunds take 30 days. Contact support! Anything else?");
        assert_eq!(split, vec!["Refunds take 30 days", "Contact support", "Anything else"]);
    }

    #[test]
    fn reply_normalization_collapses_noise() {
        assert_eq!(normalize_reply("  Yes, do it!  "), "yes, do it");
        assert_eq!(normalize_reply("GO   AHEAD."), "go ahead");
    }
}
