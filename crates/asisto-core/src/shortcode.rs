//! Human-readable identity labels: three letters derived from the name plus the year.

use chrono::Datelike;

const CODE_LETTERS: usize = 3;
const PAD_LETTER: char = 'X';

/// Derive the short code for `name` enrolled in `year`.
///
/// Letters are the initials of each word; when there are fewer than three,
/// the following letters of the first word fill in, then `X`. Longer
/// initials are truncated. Not unique: equal names in the same year share a code.
pub fn short_code(name: &str, year: i32) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();

    let mut letters: Vec<char> = words
        .iter()
        .filter_map(|w| w.chars().next())
        .flat_map(char::to_uppercase)
        .collect();

    if letters.len() < CODE_LETTERS {
        if let Some(first) = words.first() {
            for c in first.chars().skip(1).flat_map(char::to_uppercase) {
                if letters.len() >= CODE_LETTERS {
                    break;
                }
                letters.push(c);
            }
        }
    }

    letters.resize(CODE_LETTERS, PAD_LETTER);

    let mut code: String = letters.into_iter().collect();
    code.push_str(&format!("{year:04}"));
    code
}

/// Short code using the current UTC year.
pub fn short_code_now(name: &str) -> String {
    short_code(name, chrono::Utc::now().year())
}
