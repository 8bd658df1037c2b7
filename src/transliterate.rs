//! Romanization of Korean (Hangul) display names.
//!
//! Names are romanized syllable by syllable according to the Revised Romanization of Korean.
//! Every character is separated by a single space before romanization, so consonant
//! assimilation across syllables never applies and the output is stable per syllable,
//! e.g. `홍길동` becomes `HONG GIL DONG`.

const SYLLABLE_FIRST: u32 = 0xAC00;
const SYLLABLE_LAST: u32 = 0xD7A3;
const MEDIAL_COUNT: u32 = 21;
const FINAL_COUNT: u32 = 28;

const INITIALS: [&str; 19] = [
	"g", "kk", "n", "d", "tt", "r", "m", "b", "pp", "s", "ss", "", "j", "jj", "ch", "k", "t", "p",
	"h",
];

const MEDIALS: [&str; 21] = [
	"a", "ae", "ya", "yae", "eo", "e", "yeo", "ye", "o", "wa", "wae", "oe", "yo", "u", "wo", "we",
	"wi", "yu", "eu", "ui", "i",
];

const FINALS: [&str; 28] = [
	"", "k", "k", "k", "n", "n", "n", "t", "l", "k", "m", "l", "l", "l", "p", "l", "m", "p", "p",
	"t", "t", "ng", "t", "t", "k", "t", "p", "t",
];

/// Returns `true` if the text contains at least one precomposed Hangul syllable.
pub fn has_hangul(text: &str) -> bool {
	text.chars().any(is_hangul_syllable)
}

const fn is_hangul_syllable(c: char) -> bool {
	let code = c as u32;
	code >= SYLLABLE_FIRST && code <= SYLLABLE_LAST
}

/// Converts a Korean display name into its uppercase romanized form.
///
/// Input without Hangul syllables is returned unchanged. Characters outside the Hangul
/// syllable block are passed through as they are.
pub fn transliterate(name: &str) -> String {
	if !has_hangul(name) {
		return name.to_owned();
	}

	let spaced = name.chars().map(String::from).collect::<Vec<_>>().join(" ");
	romanize(&spaced).map_or_else(|| name.to_owned(), |romanized| romanized.to_uppercase())
}

fn romanize(text: &str) -> Option<String> {
	let mut romanized = String::with_capacity(text.len() * 2);
	for c in text.chars() {
		if is_hangul_syllable(c) {
			romanized.push_str(&romanize_syllable(c)?);
		} else {
			romanized.push(c);
		}
	}
	Some(romanized)
}

fn romanize_syllable(syllable: char) -> Option<String> {
	let index = (syllable as u32).checked_sub(SYLLABLE_FIRST)?;
	let initial = INITIALS.get((index / (MEDIAL_COUNT * FINAL_COUNT)) as usize)?;
	let medial = MEDIALS.get(((index % (MEDIAL_COUNT * FINAL_COUNT)) / FINAL_COUNT) as usize)?;
	let last = FINALS.get((index % FINAL_COUNT) as usize)?;

	Some(format!("{initial}{medial}{last}"))
}
