//! Language tag handling and the voice lookup table.

/// Voice chosen for a synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSelection {
    /// BCP-47 locale sent to the backend, e.g. `ar-EG`
    pub locale: String,
    /// Backend voice name; `None` lets the backend pick for the locale
    pub name: Option<String>,
}

/// language subtag → (locale, voice name)
const VOICE_TABLE: &[(&str, &str, &str)] = &[
    ("ar", "ar-EG", "ar-XA-Standard-A"),
    ("en", "en-US", "en-US-Standard-A"),
    ("es", "es-ES", "es-ES-Standard-A"),
    ("fr", "fr-FR", "fr-FR-Standard-A"),
    ("de", "de-DE", "de-DE-Standard-A"),
    ("it", "it-IT", "it-IT-Standard-A"),
    ("pt", "pt-BR", "pt-BR-Standard-A"),
    ("hi", "hi-IN", "hi-IN-Standard-A"),
    ("tr", "tr-TR", "tr-TR-Standard-A"),
];

/// ISO 639-2 codes some backends report instead of two-letter subtags.
const THREE_LETTER: &[(&str, &str)] = &[
    ("ara", "ar"),
    ("eng", "en"),
    ("spa", "es"),
    ("fra", "fr"),
    ("fre", "fr"),
    ("deu", "de"),
    ("ger", "de"),
    ("ita", "it"),
    ("por", "pt"),
    ("hin", "hi"),
    ("tur", "tr"),
];

/// Primary language subtag of a tag such as `ar-EG`, `en_us` or `ara`,
/// if it is one the voice table knows.
pub fn language_subtag(tag: &str) -> Option<&'static str> {
    let primary = tag
        .trim()
        .split(|c: char| c == '-' || c == '_')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    let two_letter = THREE_LETTER
        .iter()
        .find(|(long, _)| *long == primary)
        .map(|(_, short)| *short)
        .unwrap_or(primary.as_str());

    VOICE_TABLE
        .iter()
        .find(|(subtag, _, _)| *subtag == two_letter)
        .map(|(subtag, _, _)| *subtag)
}

pub fn is_arabic(tag: &str) -> bool {
    language_subtag(tag) == Some("ar")
}

fn is_arabic_char(c: char) -> bool {
    matches!(c,
        '\u{0600}'..='\u{06FF}'
        | '\u{0750}'..='\u{077F}'
        | '\u{08A0}'..='\u{08FF}'
        | '\u{FB50}'..='\u{FDFF}'
        | '\u{FE70}'..='\u{FEFF}')
}

/// Guess the language of reply text when no transcript language exists.
///
/// Only Arabic is detected: if more than 30% of the letters are Arabic
/// script the text is Arabic, otherwise no guess is made.
pub fn detect_script_language(text: &str) -> Option<&'static str> {
    let (letters, arabic) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(letters, arabic), c| {
            (letters + 1, arabic + is_arabic_char(c) as usize)
        });

    if letters > 0 && arabic * 10 > letters * 3 {
        Some("ar")
    } else {
        None
    }
}

/// Pick the voice for `text`.
///
/// Order: detected language from the transcript, then a script guess over
/// the text, then `default_locale`. A default locale outside the table is
/// passed through without a voice name.
pub fn select_voice(detected: Option<&str>, text: &str, default_locale: &str) -> VoiceSelection {
    let subtag = detected
        .and_then(language_subtag)
        .or_else(|| detect_script_language(text))
        .or_else(|| language_subtag(default_locale));

    match subtag.and_then(|s| VOICE_TABLE.iter().find(|(subtag, _, _)| *subtag == s)) {
        Some((_, locale, name)) => VoiceSelection {
            locale: locale.to_string(),
            name: Some(name.to_string()),
        },
        None => VoiceSelection {
            locale: default_locale.to_string(),
            name: None,
        },
    }
}
