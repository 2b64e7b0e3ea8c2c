//! Transcript post-processing.
//!
//! Turns raw recognizer output into user-facing text according to a mode
//! (`none | basic | standard | advanced`) and an application profile derived
//! from the client's app hint. `advanced` adds a best-effort LLM pass on top
//! of `standard`; everything else is deterministic local rewriting.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dictionary::{is_word_joining, PersonalDictionary};
use crate::enhancer::{enhance_or_passthrough, Enhancer};

/// Texts shorter than this are never sent to the enhancer
const MIN_ENHANCE_CHARS: usize = 16;

/// Post-processing mode, ordered by how much rewriting it does
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    None,
    Basic,
    Standard,
    Advanced,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "basic" => Some(Self::Basic),
            "standard" => Some(Self::Standard),
            "advanced" => Some(Self::Advanced),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Advanced => "advanced",
        }
    }
}

/// Application category resolved from the client app hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileCategory {
    Coding,
    Writing,
    Chat,
    Browser,
    Terminal,
    General,
}

impl ProfileCategory {
    /// Map an `"AppName|bundle.id"` hint through the fixed substring table.
    pub fn from_app_hint(hint: Option<&str>) -> Self {
        let Some(hint) = hint else {
            return Self::General;
        };
        let hint = hint.to_lowercase();
        const TABLE: &[(&[&str], ProfileCategory)] = &[
            (&["xcode", "vscode", "jetbrains", "sublime"], ProfileCategory::Coding),
            (&["notion", "word", "pages"], ProfileCategory::Writing),
            (&["wechat", "discord", "slack"], ProfileCategory::Chat),
            (&["chrome", "safari", "firefox"], ProfileCategory::Browser),
            (&["terminal", "iterm"], ProfileCategory::Terminal),
        ];
        for (needles, category) in TABLE {
            if needles.iter().any(|n| hint.contains(n)) {
                return *category;
            }
        }
        Self::General
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Writing => "writing",
            Self::Chat => "chat",
            Self::Browser => "browser",
            Self::Terminal => "terminal",
            Self::General => "general",
        }
    }
}

/// The switches a profile controls
#[derive(Debug, Clone, Copy)]
struct ProfileSwitches {
    punctuation: bool,
    casing: bool,
    drop_fillers: bool,
    paragraph_breaks: bool,
}

fn switches_for(category: ProfileCategory) -> ProfileSwitches {
    match category {
        // Dictation into an editor or shell must come through verbatim in
        // shape; only fillers are stripped
        ProfileCategory::Coding | ProfileCategory::Terminal => ProfileSwitches {
            punctuation: false,
            casing: false,
            drop_fillers: true,
            paragraph_breaks: false,
        },
        // Long-form writing gets full casing normalization
        ProfileCategory::Writing => ProfileSwitches {
            punctuation: true,
            casing: true,
            drop_fillers: true,
            paragraph_breaks: true,
        },
        ProfileCategory::General => ProfileSwitches {
            punctuation: true,
            casing: false,
            drop_fillers: true,
            paragraph_breaks: true,
        },
        ProfileCategory::Chat | ProfileCategory::Browser => ProfileSwitches {
            punctuation: true,
            casing: false,
            drop_fillers: true,
            paragraph_breaks: false,
        },
    }
}

/// Runtime-adjustable post-processing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessSettings {
    pub filler_words: Vec<String>,
    pub correction_cues: Vec<String>,
    pub default_mode: Mode,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            filler_words: ["um", "uh", "like", "you know", "嗯", "啊", "那个"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            correction_cues: ["no wait", "actually no", "i mean", "不对"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_mode: Mode::Standard,
        }
    }
}

/// Counters emitted alongside every processed transcript
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostProcessStats {
    pub fillers_removed: usize,
    pub duplicates_removed: usize,
    pub corrections_applied: usize,
    pub dict_replacements: usize,
    pub total_changes: usize,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_enhanced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub text: String,
    pub stats: PostProcessStats,
}

/// Shared post-processor. Settings behind a reader-writer lock; the
/// dictionary and enhancer are process-wide handles.
pub struct PostProcessor {
    settings: RwLock<PostProcessSettings>,
    dictionary: Arc<PersonalDictionary>,
    enhancer: Option<Arc<dyn Enhancer>>,
}

impl PostProcessor {
    pub fn new(
        dictionary: Arc<PersonalDictionary>,
        enhancer: Option<Arc<dyn Enhancer>>,
    ) -> Self {
        Self {
            settings: RwLock::new(PostProcessSettings::default()),
            dictionary,
            enhancer,
        }
    }

    pub fn settings(&self) -> PostProcessSettings {
        self.settings.read().unwrap().clone()
    }

    pub fn update_settings(&self, settings: PostProcessSettings) {
        *self.settings.write().unwrap() = settings;
    }

    pub fn default_mode(&self) -> Mode {
        self.settings.read().unwrap().default_mode
    }

    /// Process `text` under the given mode and profile.
    ///
    /// `silence_breaks` are byte offsets into `text` where the pipeline
    /// observed a long pause; under profiles with paragraph breaks enabled
    /// they become paragraph boundaries.
    pub async fn process(
        &self,
        text: &str,
        mode: Mode,
        category: ProfileCategory,
        silence_breaks: &[usize],
    ) -> ProcessOutcome {
        let mut stats = PostProcessStats {
            mode: mode.as_str().to_string(),
            ..Default::default()
        };

        if mode == Mode::None {
            return ProcessOutcome {
                text: text.to_string(),
                stats,
            };
        }

        let settings = self.settings();
        let switches = switches_for(category);

        let broken = if mode >= Mode::Standard && switches.paragraph_breaks {
            insert_paragraph_breaks(text, silence_breaks)
        } else {
            text.to_string()
        };

        let mut paragraphs = Vec::new();
        for paragraph in broken.split("\n\n") {
            let mut p = collapse_duplicates(paragraph, &mut stats.duplicates_removed);
            if mode >= Mode::Standard {
                p = apply_corrections(&p, &settings.correction_cues, &mut stats.corrections_applied);
                if switches.drop_fillers {
                    p = remove_fillers(&p, &settings.filler_words, &mut stats.fillers_removed);
                }
            }
            p = normalize_whitespace(&p);
            if switches.punctuation {
                p = fix_punctuation_spacing(&p);
            }
            if mode >= Mode::Standard {
                let (replaced, n) = self.dictionary.apply(&p);
                stats.dict_replacements += n;
                p = replaced;
            }
            if mode >= Mode::Standard && switches.casing {
                p = capitalize_sentences(&p);
            }
            if !p.is_empty() {
                paragraphs.push(p);
            }
        }
        let mut output = paragraphs.join("\n\n");

        if mode == Mode::Advanced {
            if let Some(ref enhancer) = self.enhancer {
                if output.chars().count() >= MIN_ENHANCE_CHARS {
                    let (enhanced, ok) =
                        enhance_or_passthrough(enhancer.as_ref(), &output, category.as_str()).await;
                    stats.ai_enhanced = Some(ok);
                    if ok {
                        stats.ai_provider = Some(enhancer.provider().to_string());
                        output = enhanced;
                    }
                } else {
                    debug!("Skipping enhancement, text under {} chars", MIN_ENHANCE_CHARS);
                }
            }
        }

        stats.total_changes = stats.fillers_removed
            + stats.duplicates_removed
            + stats.corrections_applied
            + stats.dict_replacements;

        ProcessOutcome {
            text: output,
            stats,
        }
    }
}

/// Insert `\n\n` at the given byte offsets (clamped to char boundaries)
fn insert_paragraph_breaks(text: &str, offsets: &[usize]) -> String {
    if offsets.is_empty() {
        return text.to_string();
    }
    let mut sorted: Vec<usize> = offsets
        .iter()
        .copied()
        .filter(|&o| o > 0 && o < text.len())
        .collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = String::with_capacity(text.len() + sorted.len() * 2);
    let mut cursor = 0usize;
    for mut offset in sorted {
        while offset < text.len() && !text.is_char_boundary(offset) {
            offset += 1;
        }
        if offset <= cursor || offset >= text.len() {
            continue;
        }
        out.push_str(text[cursor..offset].trim_end());
        out.push_str("\n\n");
        cursor = offset;
    }
    out.push_str(text[cursor..].trim_start());
    out
}

/// Token comparison form: lowercase with edge punctuation stripped
fn token_key(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Collapse immediate word-level duplicates ("the the" -> "the")
fn collapse_duplicates(text: &str, removed: &mut usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut prev_key = String::new();
    for token in text.split_whitespace() {
        let key = token_key(token);
        if !key.is_empty() && key == prev_key {
            *removed += 1;
            continue;
        }
        prev_key = key;
        kept.push(token);
    }
    kept.join(" ")
}

/// Find `phrase` in `text` at word boundaries, ASCII-case-insensitively.
/// Returns the byte range of the first occurrence.
fn find_phrase(text: &str, phrase: &str) -> Option<(usize, usize)> {
    let n = phrase.len();
    if n == 0 || text.len() < n {
        return None;
    }
    let mut i = 0usize;
    while i + n <= text.len() {
        if text.is_char_boundary(i) && text.is_char_boundary(i + n) {
            let candidate = &text[i..i + n];
            if candidate.eq_ignore_ascii_case(phrase) {
                let prev_ok = text[..i]
                    .chars()
                    .next_back()
                    .map(|c| !is_word_joining(c))
                    .unwrap_or(true);
                let next_ok = text[i + n..]
                    .chars()
                    .next()
                    .map(|c| !is_word_joining(c))
                    .unwrap_or(true);
                if prev_ok && next_ok {
                    return Some((i, i + n));
                }
            }
        }
        i += 1;
    }
    None
}

/// Drop everything from the previous sentence boundary through a detected
/// self-correction cue; what follows the cue is the speaker's correction.
fn apply_corrections(text: &str, cues: &[String], applied: &mut usize) -> String {
    const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？', '\n'];
    let mut current = text.to_string();

    // Bounded loop; each iteration removes at least the cue itself
    for _ in 0..16 {
        let hit = cues
            .iter()
            .filter_map(|cue| find_phrase(&current, cue))
            .min_by_key(|&(start, _)| start);
        let Some((cue_start, cue_end)) = hit else {
            break;
        };

        let boundary = current[..cue_start]
            .rfind(SENTENCE_ENDS)
            .map(|i| i + current[i..].chars().next().unwrap().len_utf8())
            .unwrap_or(0);

        let mut rewritten = String::with_capacity(current.len());
        rewritten.push_str(&current[..boundary]);
        rewritten.push(' ');
        rewritten.push_str(current[cue_end..].trim_start_matches([' ', ',']));
        current = rewritten;
        *applied += 1;
    }
    current
}

/// Remove filler words/phrases at word boundaries. CJK characters never
/// join words, so CJK fillers also match mid-run.
fn remove_fillers(text: &str, fillers: &[String], removed: &mut usize) -> String {
    let mut current = text.to_string();
    for filler in fillers {
        loop {
            let Some((start, end)) = find_phrase(&current, filler) else {
                break;
            };
            // Swallow one trailing separator so "um hello" -> "hello"
            let after = current[end..]
                .char_indices()
                .take_while(|(_, c)| *c == ' ' || *c == ',')
                .last()
                .map(|(i, c)| end + i + c.len_utf8())
                .unwrap_or(end);
            current.replace_range(start..after, "");
            *removed += 1;
        }
    }
    current
}

/// Collapse runs of spaces and tabs; trims the ends
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove spaces before punctuation, ensure one after (decimals excepted)
fn fix_punctuation_spacing(text: &str) -> String {
    const PUNCT: &[char] = &[',', '.', ';', ':', '!', '?'];
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());

    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' && chars.get(i + 1).map(|n| PUNCT.contains(n)).unwrap_or(false) {
            continue;
        }
        out.push(c);
        if PUNCT.contains(&c) {
            let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
            if let Some(&next) = chars.get(i + 1) {
                let next_digit = next.is_ascii_digit();
                if next.is_alphanumeric() && !(prev_digit && next_digit) {
                    out.push(' ');
                }
            }
        }
    }
    out
}

/// Uppercase the first letter of each sentence
fn capitalize_sentences(text: &str) -> String {
    const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？'];
    let mut out = String::with_capacity(text.len());
    let mut at_sentence_start = true;
    for c in text.chars() {
        if at_sentence_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
            at_sentence_start = false;
        } else {
            if SENTENCE_ENDS.contains(&c) {
                at_sentence_start = true;
            } else if !c.is_whitespace() {
                at_sentence_start = false;
            }
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> PostProcessor {
        PostProcessor::new(Arc::new(PersonalDictionary::new()), None)
    }

    async fn run(text: &str, mode: Mode) -> ProcessOutcome {
        processor()
            .process(text, mode, ProfileCategory::General, &[])
            .await
    }

    #[tokio::test]
    async fn test_mode_none_is_identity() {
        let input = "the the   weird,spacing  um text";
        let outcome = run(input, Mode::None).await;
        assert_eq!(outcome.text, input);
        assert_eq!(outcome.stats.total_changes, 0);
        assert_eq!(outcome.stats.mode, "none");
    }

    #[tokio::test]
    async fn test_basic_collapses_duplicates_and_whitespace() {
        let outcome = run("the the quick  brown  fox", Mode::Basic).await;
        assert_eq!(outcome.text, "the quick brown fox");
        assert_eq!(outcome.stats.duplicates_removed, 1);
        assert!(outcome.stats.total_changes >= 1);
        assert_eq!(outcome.stats.mode, "basic");
    }

    #[tokio::test]
    async fn test_basic_fixes_punctuation_spacing() {
        let outcome = run("hello ,world .done", Mode::Basic).await;
        assert_eq!(outcome.text, "hello, world. done");
    }

    #[tokio::test]
    async fn test_basic_keeps_fillers() {
        let outcome = run("um hello uh there", Mode::Basic).await;
        assert_eq!(outcome.text, "um hello uh there");
        assert_eq!(outcome.stats.fillers_removed, 0);
    }

    #[tokio::test]
    async fn test_standard_removes_fillers() {
        let outcome = run("um hello uh this is like a test", Mode::Standard).await;
        assert_eq!(outcome.text, "hello this is a test");
        assert_eq!(outcome.stats.fillers_removed, 3);
        assert_eq!(outcome.stats.mode, "standard");
    }

    #[tokio::test]
    async fn test_standard_removes_cjk_fillers() {
        let outcome = run("嗯今天天气那个不错", Mode::Standard).await;
        assert_eq!(outcome.text, "今天天气不错");
        assert_eq!(outcome.stats.fillers_removed, 2);
    }

    #[tokio::test]
    async fn test_filler_does_not_match_inside_words() {
        let outcome = run("the umbrella is unlike others", Mode::Standard).await;
        assert_eq!(outcome.text, "the umbrella is unlike others");
        assert_eq!(outcome.stats.fillers_removed, 0);
    }

    #[tokio::test]
    async fn test_multiword_filler() {
        let outcome = run("it was you know pretty good", Mode::Standard).await;
        assert_eq!(outcome.text, "it was pretty good");
        assert_eq!(outcome.stats.fillers_removed, 1);
    }

    #[tokio::test]
    async fn test_self_correction_drops_preceding_phrase() {
        let outcome = run("take the bus no wait the train", Mode::Standard).await;
        assert_eq!(outcome.text, "the train");
        assert_eq!(outcome.stats.corrections_applied, 1);
    }

    #[tokio::test]
    async fn test_self_correction_respects_sentence_boundary() {
        let outcome =
            run("We ship on Friday. Take the bus actually no the train", Mode::Standard).await;
        assert_eq!(outcome.text, "We ship on Friday. the train");
        assert_eq!(outcome.stats.corrections_applied, 1);
    }

    #[tokio::test]
    async fn test_dictionary_applied_in_standard() {
        let dictionary = Arc::new(PersonalDictionary::new());
        dictionary.upsert(crate::dictionary::DictionaryEntry {
            spoken: "api".to_string(),
            written: "API".to_string(),
            category: None,
            case_sensitive: false,
            whole_word: true,
        });
        let processor = PostProcessor::new(dictionary, None);
        let outcome = processor
            .process("check the api", Mode::Standard, ProfileCategory::General, &[])
            .await;
        assert_eq!(outcome.text, "check the API");
        assert_eq!(outcome.stats.dict_replacements, 1);
    }

    #[tokio::test]
    async fn test_coding_profile_preserves_shape() {
        let processor = processor();
        let outcome = processor
            .process(
                "let x ,equal five um okay",
                Mode::Standard,
                ProfileCategory::Coding,
                &[],
            )
            .await;
        // Fillers still go, but no punctuation fixes and no capitalization
        assert_eq!(outcome.text, "let x ,equal five okay");
    }

    #[tokio::test]
    async fn test_paragraph_breaks_at_silence_hints() {
        let text = "first thought second thought";
        let outcome = processor()
            .process(text, Mode::Standard, ProfileCategory::General, &[14])
            .await;
        assert_eq!(outcome.text, "first thought\n\nsecond thought");
    }

    #[tokio::test]
    async fn test_writing_profile_capitalizes_sentences() {
        let outcome = processor()
            .process(
                "hello there. nice day today. yes",
                Mode::Standard,
                ProfileCategory::Writing,
                &[],
            )
            .await;
        assert_eq!(outcome.text, "Hello there. Nice day today. Yes");
    }

    #[tokio::test]
    async fn test_advanced_without_enhancer_matches_standard() {
        let outcome = run("um hello this is a longer test", Mode::Advanced).await;
        assert_eq!(outcome.text, "hello this is a longer test");
        assert!(outcome.stats.ai_enhanced.is_none());
        assert_eq!(outcome.stats.mode, "advanced");
    }

    #[tokio::test]
    async fn test_advanced_short_text_skips_enhancer() {
        struct PanickyEnhancer;
        #[async_trait::async_trait]
        impl Enhancer for PanickyEnhancer {
            fn provider(&self) -> &'static str {
                "panicky"
            }
            async fn enhance(
                &self,
                _t: &str,
                _h: &str,
            ) -> Result<String, crate::enhancer::EnhancerError> {
                panic!("must not be called for short text");
            }
        }
        let processor = PostProcessor::new(
            Arc::new(PersonalDictionary::new()),
            Some(Arc::new(PanickyEnhancer)),
        );
        let outcome = processor
            .process("short one", Mode::Advanced, ProfileCategory::General, &[])
            .await;
        assert_eq!(outcome.text, "short one");
    }

    #[tokio::test]
    async fn test_advanced_enhancer_failure_falls_back() {
        struct DownEnhancer;
        #[async_trait::async_trait]
        impl Enhancer for DownEnhancer {
            fn provider(&self) -> &'static str {
                "down"
            }
            async fn enhance(
                &self,
                _t: &str,
                _h: &str,
            ) -> Result<String, crate::enhancer::EnhancerError> {
                Err(crate::enhancer::EnhancerError::RequestFailed("502".into()))
            }
        }
        let processor = PostProcessor::new(
            Arc::new(PersonalDictionary::new()),
            Some(Arc::new(DownEnhancer)),
        );
        let outcome = processor
            .process(
                "this text is long enough to be enhanced",
                Mode::Advanced,
                ProfileCategory::General,
                &[],
            )
            .await;
        assert_eq!(outcome.text, "this text is long enough to be enhanced");
        assert_eq!(outcome.stats.ai_enhanced, Some(false));
        assert!(outcome.stats.ai_provider.is_none());
    }

    #[test]
    fn test_profile_mapping_table() {
        use ProfileCategory::*;
        let cases = [
            ("Visual Studio Code|com.microsoft.vscode", Coding),
            ("Xcode|com.apple.dt.Xcode", Coding),
            ("Notion|notion.id", Writing),
            ("Slack|com.tinyspeck.slackmacgap", Chat),
            ("Google Chrome|com.google.Chrome", Browser),
            ("iTerm2|com.googlecode.iterm2", Terminal),
            ("Blender|org.blenderfoundation.blender", General),
        ];
        for (hint, expected) in cases {
            assert_eq!(ProfileCategory::from_app_hint(Some(hint)), expected, "{hint}");
        }
        assert_eq!(ProfileCategory::from_app_hint(None), General);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("standard"), Some(Mode::Standard));
        assert_eq!(Mode::parse("sparkly"), None);
        assert!(Mode::Basic < Mode::Standard);
    }

    #[test]
    fn test_settings_update() {
        let processor = processor();
        let mut settings = processor.settings();
        settings.filler_words.push("basically".to_string());
        processor.update_settings(settings);
        assert!(processor
            .settings()
            .filler_words
            .contains(&"basically".to_string()));
    }
}
