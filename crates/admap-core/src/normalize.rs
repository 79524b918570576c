//! Comparison keys for administrative unit names.
//!
//! `normalize` turns a raw name such as `"Thành phố Thủ Đức"` into a key such as `"thu duc"`:
//!
//! 1. strip one leading administrative prefix for the tier (`Quận`, `TP.`, `District`, ...)
//! 2. fold diacritics to the base Latin letter (`đ` folds to `d` as well)
//! 3. replace every character that is not a letter, digit or whitespace with a space
//! 4. collapse whitespace runs and trim
//! 5. lowercase
//!
//! Vietnamese prefixes are recognised on the lowercased, still accented word, so a name word
//! that only folds to a prefix (`"Xà"`, `"Quán"`) is kept. ASCII abbreviations and English words
//! compare after folding, so `"Q."` and `"Ṕ."` behave alike. A prefix is only stripped when
//! something remains after it and the remainder does not itself start with a prefix of the same
//! tier; after an ASCII prefix that check also runs on folded words. Together these keep
//! `normalize` idempotent.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::Tier;

const PROVINCE_PREFIXES: &[&[&str]] = &[
    &["tỉnh"],
    &["thành", "phố"],
    &["thủ", "đô"],
    &["tp"],
    &["province"],
    &["city"],
];

const DISTRICT_PREFIXES: &[&[&str]] = &[
    &["quận"],
    &["huyện"],
    &["thị", "xã"],
    &["thành", "phố"],
    &["tp"],
    &["tx"],
    &["q"],
    &["h"],
    &["district"],
    &["town"],
    &["precinct"],
    &["city"],
];

const WARD_PREFIXES: &[&[&str]] = &[
    &["phường"],
    &["xã"],
    &["thị", "trấn"],
    &["tt"],
    &["p"],
    &["ward"],
    &["commune"],
    &["township"],
];

/// Administrative prefixes recognised for a tier, as lowercase NFC words.
pub fn tier_prefixes(tier: Tier) -> &'static [&'static [&'static str]] {
    match tier {
        Tier::Province => PROVINCE_PREFIXES,
        Tier::District => DISTRICT_PREFIXES,
        Tier::Ward => WARD_PREFIXES,
    }
}

/// Normalize a raw unit name into its comparison key. Never fails; empty input yields `""`.
pub fn normalize(raw: &str, tier: Tier) -> String {
    let stripped = strip_admin_prefix(raw, tier);
    let folded = fold_diacritics(stripped);
    let spaced = folded
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>();
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    lowercase(&collapsed)
}

/// Remove at most one leading administrative prefix, returning the remainder of `raw`.
pub fn strip_admin_prefix(raw: &str, tier: Tier) -> &str {
    let words = comparison_words(raw);

    let Some(prefix) = leading_prefix(&words, tier, WordMatch::Spelled) else {
        return raw;
    };
    let guard = if prefix.iter().all(|w| w.is_ascii()) {
        WordMatch::Folded
    } else {
        WordMatch::Spelled
    };
    if leading_prefix(&words[prefix.len()..], tier, guard).is_some() {
        return raw;
    }
    &raw[words[prefix.len()].start..]
}

/// Decompose and drop combining marks. `đ`/`Đ` have no decomposition and are mapped explicitly.
pub fn fold_diacritics(input: &str) -> String {
    input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            'đ' | 'ð' => 'd',
            'Đ' | 'Ð' => 'D',
            other => other,
        })
        .collect()
}

fn lowercase(input: &str) -> String {
    input
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

fn folded_key(input: &str) -> String {
    lowercase(&fold_diacritics(input))
}

struct Word {
    start: usize,
    spelled: String,
    folded: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WordMatch {
    /// Accented prefixes must match letter for letter; ASCII ones compare folded.
    Spelled,
    /// Every prefix compares folded.
    Folded,
}

impl Word {
    fn is(&self, prefix_word: &str, mode: WordMatch) -> bool {
        match mode {
            WordMatch::Spelled if !prefix_word.is_ascii() => self.spelled == prefix_word,
            _ => self.folded == folded_key(prefix_word),
        }
    }
}

fn comparison_words(raw: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut current: Option<usize> = None;

    let flush = |start: usize, end: usize, words: &mut Vec<Word>| {
        let text = &raw[start..end];
        let folded = folded_key(text);
        if !folded.is_empty() {
            let spelled = text.chars().flat_map(char::to_lowercase).nfc().collect();
            words.push(Word { start, spelled, folded });
        }
    };

    for (idx, c) in raw.char_indices() {
        let in_word = c.is_alphanumeric() || is_combining_mark(c);
        match (in_word, current) {
            (true, None) => current = Some(idx),
            (false, Some(start)) => {
                flush(start, idx, &mut words);
                current = None;
            }
            _ => {}
        }
    }
    if let Some(start) = current {
        flush(start, raw.len(), &mut words);
    }
    words
}

/// First tier prefix that `words` starts with and that leaves a remainder.
fn leading_prefix(words: &[Word], tier: Tier, mode: WordMatch) -> Option<&'static [&'static str]> {
    tier_prefixes(tier)
        .iter()
        .copied()
        .find(|prefix| {
            words.len() > prefix.len() && prefix.iter().zip(words).all(|(p, w)| w.is(p, mode))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_vietnamese_prefixes_per_tier() {
        assert_eq!(normalize("Thành phố Hồ Chí Minh", Tier::Province), "ho chi minh");
        assert_eq!(normalize("Tỉnh Thừa Thiên Huế", Tier::Province), "thua thien hue");
        assert_eq!(normalize("Quận 1", Tier::District), "1");
        assert_eq!(normalize("Huyện Củ Chi", Tier::District), "cu chi");
        assert_eq!(normalize("Thị xã Sơn Tây", Tier::District), "son tay");
        assert_eq!(normalize("Phường Bến Nghé", Tier::Ward), "ben nghe");
        assert_eq!(normalize("Thị trấn Cờ Đỏ", Tier::Ward), "co do");
    }

    #[test]
    fn english_and_abbreviated_prefixes_reduce_to_the_same_key() {
        assert_eq!(normalize("District 1", Tier::District), normalize("Quận 1", Tier::District));
        assert_eq!(normalize("TP.HCM", Tier::Province), "hcm");
        assert_eq!(normalize("Q. 3", Tier::District), "3");
        assert_eq!(normalize("Ward Ben Nghe", Tier::Ward), "ben nghe");
    }

    #[test]
    fn prefixes_are_tier_specific() {
        assert_eq!(normalize("Phường 5", Tier::District), "phuong 5");
        assert_eq!(normalize("Quận 5", Tier::Ward), "quan 5");
    }

    #[test]
    fn prefix_matching_is_case_insensitive() {
        assert_eq!(
            normalize("Province X", Tier::Province),
            normalize("province x", Tier::Province)
        );
        assert_eq!(normalize("QUẬN Bình Thạnh", Tier::District), "binh thanh");
        assert_eq!(normalize("HUYỆN Củ Chi", Tier::District), "cu chi");
    }

    #[test]
    fn name_words_that_fold_to_a_prefix_are_kept() {
        assert_eq!(normalize("Xà Bang", Tier::Ward), "xa bang");
        assert_eq!(normalize("Xã Xà Bang", Tier::Ward), "xa bang");
        assert_eq!(normalize("Quán Toan", Tier::District), "quan toan");
        assert_eq!(normalize("Huyện Quán Toan", Tier::District), "quan toan");
        assert_eq!(normalize("quan binh thanh", Tier::District), "quan binh thanh");
    }

    #[test]
    fn at_most_one_prefix_is_stripped() {
        assert_eq!(
            normalize("Thành phố Thành phố Huế", Tier::Province),
            "thanh pho thanh pho hue"
        );
        assert_eq!(normalize("Xã Xã Bang", Tier::Ward), "xa xa bang");
        assert_eq!(normalize("Q Quận 1", Tier::District), "q quan 1");
    }

    #[test]
    fn bare_prefix_is_kept() {
        assert_eq!(normalize("Huyện", Tier::District), "huyen");
        assert_eq!(normalize("  Tỉnh  ", Tier::Province), "tinh");
    }

    #[test]
    fn abbreviations_compare_after_folding() {
        assert_eq!(normalize("Ṕ. 5", Tier::Ward), "5");
        assert_eq!(normalize("P. Ṕ 5", Tier::Ward), "p p 5");
    }

    #[test]
    fn folds_d_stroke_and_punctuation() {
        assert_eq!(normalize("Đống Đa", Tier::District), "dong da");
        assert_eq!(normalize("Bà Rịa - Vũng Tàu", Tier::Province), "ba ria vung tau");
        assert_eq!(normalize("Phường  Tân   Định,", Tier::Ward), "tan dinh");
    }

    #[test]
    fn decomposed_input_matches_composed_input() {
        let composed = "Quận Hoàn Kiếm";
        let decomposed = composed.nfd().collect::<String>();
        assert_eq!(normalize(&decomposed, Tier::District), normalize(composed, Tier::District));
    }

    #[test]
    fn empty_input_yields_empty_key() {
        assert_eq!(normalize("", Tier::Ward), "");
        assert_eq!(normalize(" -- ", Tier::Ward), "");
    }

    fn name_strategy() -> impl Strategy<Value = String> {
        let pieces = prop::sample::select(vec![
            "Quận", "quan", "Huyện", "Thành phố", "TP.", "Tỉnh", "Phường", "Xã", "xa", "Thị",
            "trấn", "xã", "District", "Ward", "Đống", "Đa", "Bến", "Nghé", "1", "12", "-", ",",
            "(", ")", "  ", "_", "Ă", "ư", "Ơ",
        ]);
        prop::collection::vec(pieces, 0..7).prop_map(|parts| parts.join(" "))
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(raw in name_strategy(), tier_idx in 0usize..3) {
            let tier = Tier::ALL[tier_idx];
            let once = normalize(&raw, tier);
            prop_assert_eq!(normalize(&once, tier), once);
        }

        #[test]
        fn normalize_is_idempotent_on_arbitrary_text(
            raw in "[\\p{Latin}\\p{Nd} .,()\\-]{0,24}",
            tier_idx in 0usize..3
        ) {
            let tier = Tier::ALL[tier_idx];
            let once = normalize(&raw, tier);
            prop_assert_eq!(normalize(&once, tier), once);
        }

        #[test]
        fn output_is_lowercase_alphanumeric_words(raw in name_strategy()) {
            let key = normalize(&raw, Tier::Ward);
            prop_assert!(!key.starts_with(' ') && !key.ends_with(' ') && !key.contains("  "));
            prop_assert!(key.chars().all(|c| c == ' ' || c.is_alphanumeric()));
        }
    }
}
