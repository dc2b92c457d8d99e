//! Text cleaning, CJK-aware segmentation, and the two similarity scores
//! (char-level LCS ratio, token-set Jaccard) used by the text tier.
//!
//! Latin scripts tokenize fine on word boundaries, but Chinese has no
//! spaces: jieba segments ideograph runs into words, and kana/hangul fall
//! back to bigrams (jieba doesn't cover them).

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

fn jieba() -> &'static jieba_rs::Jieba {
    static INSTANCE: OnceLock<jieba_rs::Jieba> = OnceLock::new();
    INSTANCE.get_or_init(jieba_rs::Jieba::new)
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:https?://|www\.)\S+").unwrap())
}

fn handle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@\w{2,}").unwrap())
}

fn hashtag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#[^\s#]+").unwrap())
}

/// Channel-boilerplate phrases that carry no content signal and would
/// otherwise inflate similarity between unrelated posts.
fn boilerplate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(forwarded from|follow us|subscribe for more|join (our|the) channel|tap to read|read more|关注我们|订阅频道|转发自|欢迎转发|来源[:：]?)",
        )
        .unwrap()
    })
}

/// Decorative emoji routinely pasted around reposts.
const BOILERPLATE_EMOJI: &str = "🔥📢👇‼⚡🚨❗💥🔔⬇️\u{fe0f}";

/// Strip tags, links, handles and known boilerplate, collapsing whitespace.
pub fn clean(text: &str) -> String {
    let t = url_re().replace_all(text, " ");
    let t = handle_re().replace_all(&t, " ");
    let t = hashtag_re().replace_all(&t, " ");
    let t = boilerplate_re().replace_all(&t, " ");
    let t: String = t
        .chars()
        .filter(|c| !BOILERPLATE_EMOJI.contains(*c))
        .collect();
    t.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Minimum cleaned length for LCS/Jaccard to be meaningful; shorter falls
/// back to core-content extraction.
pub const MIN_MEANINGFUL_CHARS: usize = 20;

/// Core-content extraction: lines longer than 50 chars, or failing that the
/// first 5 non-empty lines.
pub fn core_content(text: &str) -> String {
    let long: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| l.chars().count() > 50)
        .collect();
    if !long.is_empty() {
        return long.join("\n");
    }
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(5)
        .collect::<Vec<_>>()
        .join("\n")
}

/// The comparison text for a raw body: cleaned, or cleaned core content when
/// cleaning leaves too little to compare.
pub fn effective_text(raw: &str) -> String {
    let cleaned = clean(raw);
    if cleaned.chars().count() >= MIN_MEANINGFUL_CHARS {
        cleaned
    } else {
        clean(&core_content(raw))
    }
}

fn is_han(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK Unified Basic
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{F900}'..='\u{FAFF}' // CJK Compatibility
    )
}

fn is_kana_or_hangul(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'   // Hiragana + Katakana
        | '\u{AC00}'..='\u{D7AF}' // Hangul
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptClass {
    Han,
    KanaHangul,
    Word,
    Skip,
}

fn classify(c: char) -> ScriptClass {
    if is_han(c) {
        ScriptClass::Han
    } else if is_kana_or_hangul(c) {
        ScriptClass::KanaHangul
    } else if c.is_alphanumeric() {
        ScriptClass::Word
    } else {
        ScriptClass::Skip
    }
}

/// CJK-aware tokenization. Han runs go through jieba, kana/hangul runs
/// become bigrams, everything else splits on non-alphanumeric boundaries.
/// Single-character tokens are discarded throughout.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut run = String::new();
    let mut run_class = ScriptClass::Skip;

    let mut flush = |run: &mut String, class: ScriptClass, tokens: &mut Vec<String>| {
        if run.is_empty() {
            return;
        }
        match class {
            ScriptClass::Han => {
                for w in jieba().cut(run, false) {
                    if w.chars().count() > 1 {
                        tokens.push(w.to_string());
                    }
                }
            }
            ScriptClass::KanaHangul => {
                let chars: Vec<char> = run.chars().collect();
                for pair in chars.windows(2) {
                    tokens.push(pair.iter().collect());
                }
            }
            ScriptClass::Word => {
                if run.chars().count() > 1 {
                    tokens.push(run.to_lowercase());
                }
            }
            ScriptClass::Skip => {}
        }
        run.clear();
    };

    for c in text.chars() {
        let class = classify(c);
        if class != run_class {
            flush(&mut run, run_class, &mut tokens);
            run_class = class;
        }
        if class != ScriptClass::Skip {
            run.push(c);
        }
    }
    flush(&mut run, run_class, &mut tokens);
    tokens
}

/// Cap on compared characters; posts are short, and anything longer than
/// this is decided by its head anyway.
const LCS_MAX_CHARS: usize = 2000;

/// Character-level longest-common-subsequence ratio: `2·LCS / (|a| + |b|)`.
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().take(LCS_MAX_CHARS).collect();
    let b: Vec<char> = b.chars().take(LCS_MAX_CHARS).collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
        cur[0] = 0;
    }
    2.0 * prev[b.len()] as f64 / (a.len() + b.len()) as f64
}

/// Token-set Jaccard similarity.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let sa: HashSet<&str> = a.iter().map(String::as_str).collect();
    let sb: HashSet<&str> = b.iter().map(String::as_str).collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    inter as f64 / union as f64
}

/// Similarity between two already-cleaned texts: max of the LCS ratio and
/// the token-set Jaccard.
pub fn similarity_cleaned(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let ratio = lcs_ratio(a, b);
    let jac = jaccard(&tokenize(a), &tokenize(b));
    ratio.max(jac)
}

/// Similarity between two raw bodies.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    similarity_cleaned(&effective_text(a), &effective_text(b))
}
