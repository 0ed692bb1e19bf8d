//! Cursor-advancing readers over a codepoint buffer.
//!
//! Helpers for hand-written tokenizers: every reader takes the buffer and a
//! mutable cursor, advances the cursor past what it consumed on success, and
//! leaves the cursor untouched on failure. Class predicates lean on the
//! standard library's Unicode tables (`char::is_alphabetic` and friends);
//! the digit classes are ASCII because the escape grammar that consumes them
//! is.
//!
//! ## Example
//!
//!```
//! use insieme::scan::{read_letter, read_string_literal};
//!
//! let text: Vec<char> = r#""a\nb""#.chars().collect();
//! let mut position = 0;
//! let literal = read_string_literal(&text, &mut position).unwrap();
//! assert_eq!(literal, vec!['a', '\n', 'b']);
//! assert_eq!(position, text.len());
//!
//! let text: Vec<char> = "x1".chars().collect();
//! let mut position = 0;
//! assert!(read_letter(&text, &mut position));
//! assert!(!read_letter(&text, &mut position));
//! assert_eq!(position, 1);
//!```

/// Generates single-codepoint class readers.
///
/// Creates functions like `read_letter`, `read_decimal_digit`, etc., each
/// consuming one codepoint of its class.
macro_rules! class_readers {
    ($($name:ident => $pred:expr),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Consumes one `", stringify!($name), "` codepoint.")]
                pub fn [<read_ $name>](text: &[char], position: &mut usize) -> bool {
                    let matches = *position < text.len() && $pred(text[*position]);
                    if matches {
                        *position += 1;
                    }
                    matches
                }
            )*
        }
    };
}

class_readers! {
    letter => char::is_alphabetic,
    number => char::is_numeric,
    decimal_digit => |c: char| c.is_ascii_digit(),
    hexadecimal_digit => |c: char| c.is_ascii_hexdigit(),
    alphanumeric => char::is_alphanumeric,
    whitespace => char::is_whitespace,
}

/// Consumes any single codepoint.
pub fn read_character(text: &[char], position: &mut usize) -> bool {
    let matches = *position < text.len();
    if matches {
        *position += 1;
    }
    matches
}

/// Consumes `codepoint` exactly.
pub fn read_exact_character(text: &[char], position: &mut usize, codepoint: char) -> bool {
    let matches = *position < text.len() && text[*position] == codepoint;
    if matches {
        *position += 1;
    }
    matches
}

/// Peeks for `codepoint` without consuming it.
pub fn test_character(text: &[char], position: usize, codepoint: char) -> bool {
    position < text.len() && text[position] == codepoint
}

/// Greedily consumes whitespace; returns how many codepoints went.
pub fn read_whitespaces(text: &[char], position: &mut usize) -> usize {
    let start = *position;
    while *position < text.len() && text[*position].is_whitespace() {
        *position += 1;
    }
    *position - start
}

/// Consumes one codepoint that is not a double quote.
pub fn read_non_double_quote(text: &[char], position: &mut usize) -> Option<char> {
    let &c = text.get(*position)?;
    if c == '"' {
        return None;
    }
    *position += 1;
    Some(c)
}

/// Consumes one codepoint that is neither a double quote nor a backslash.
pub fn read_non_double_quote_non_backslash(text: &[char], position: &mut usize) -> Option<char> {
    let &c = text.get(*position)?;
    if c == '"' || c == '\\' {
        return None;
    }
    *position += 1;
    Some(c)
}

/// Consumes a double quote.
pub fn read_double_quote(text: &[char], position: &mut usize) -> bool {
    read_exact_character(text, position, '"')
}

fn simple_escape(codepoint: char) -> Option<char> {
    Some(match codepoint {
        'a' => '\u{07}',
        'b' => '\u{08}',
        'f' => '\u{0C}',
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        '\\' => '\\',
        '\'' => '\'',
        '"' => '"',
        '?' => '?',
        _ => return None,
    })
}

/// Consumes a simple escape sequence (`\a \b \f \n \r \t \\ \' \" \?`) and
/// yields the escaped codepoint.
pub fn read_simple_escape_sequence(text: &[char], position: &mut usize) -> Option<char> {
    let mut probe = *position;
    if !read_exact_character(text, &mut probe, '\\') {
        return None;
    }
    let resolved = simple_escape(*text.get(probe)?)?;
    *position = probe + 1;
    Some(resolved)
}

/// Consumes a `\xHHHHHH` escape — exactly six hex digits, case-insensitive —
/// and yields the codepoint. Fails (cursor unmoved) on fewer digits or a
/// value outside Unicode scalar range.
pub fn read_unicode_escape_sequence(text: &[char], position: &mut usize) -> Option<char> {
    let mut probe = *position;
    if !read_exact_character(text, &mut probe, '\\') || !read_exact_character(text, &mut probe, 'x')
    {
        return None;
    }
    let mut accumulator: u32 = 0;
    let mut digits = 0;
    while digits < 6 {
        let Some(digit) = text.get(probe).and_then(|c| c.to_digit(16)) else {
            break;
        };
        accumulator = accumulator * 16 + digit;
        probe += 1;
        digits += 1;
    }
    if digits != 6 {
        return None;
    }
    let resolved = char::from_u32(accumulator)?;
    *position = probe;
    Some(resolved)
}

/// Consumes a double-quoted string literal, applying both escape rules, and
/// yields the unescaped codepoints. The cursor ends up past the closing
/// quote. Unterminated input or an unrecognized escape fails with the cursor
/// unmoved.
pub fn read_string_literal(text: &[char], position: &mut usize) -> Option<Vec<char>> {
    let mut probe = *position;
    if !read_double_quote(text, &mut probe) {
        return None;
    }
    let mut literal = Vec::new();
    loop {
        if read_double_quote(text, &mut probe) {
            *position = probe;
            return Some(literal);
        }
        match text.get(probe) {
            None => return None,
            Some('\\') => {
                let resolved = read_simple_escape_sequence(text, &mut probe)
                    .or_else(|| read_unicode_escape_sequence(text, &mut probe))?;
                literal.push(resolved);
            }
            Some(&c) => {
                literal.push(c);
                probe += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    /// Class readers consume exactly one matching codepoint.
    #[test]
    fn test_class_readers() {
        let text = chars("aß1 \u{3042}");
        let mut position = 0;
        assert!(read_letter(&text, &mut position));
        assert!(read_letter(&text, &mut position)); // ß is a letter
        assert!(!read_letter(&text, &mut position)); // 1 is not
        assert!(read_decimal_digit(&text, &mut position));
        assert!(read_whitespace(&text, &mut position));
        assert!(read_alphanumeric(&text, &mut position)); // Hiragana
        assert_eq!(position, text.len());
        // At the end everything fails and stays put.
        assert!(!read_character(&text, &mut position));
        assert_eq!(position, text.len());
    }

    /// Hex digits accept both cases; decimal digits are ASCII only.
    #[test]
    fn test_digit_classes() {
        let text = chars("aF9");
        let mut position = 0;
        assert!(read_hexadecimal_digit(&text, &mut position));
        assert!(read_hexadecimal_digit(&text, &mut position));
        assert!(read_decimal_digit(&text, &mut position));
        assert_eq!(position, 3);
    }

    /// Exact and peeking reads.
    #[test]
    fn test_exact_and_test() {
        let text = chars("ab");
        let mut position = 0;
        assert!(test_character(&text, position, 'a'));
        assert_eq!(position, 0);
        assert!(!read_exact_character(&text, &mut position, 'b'));
        assert_eq!(position, 0);
        assert!(read_exact_character(&text, &mut position, 'a'));
        assert_eq!(position, 1);
    }

    /// Greedy whitespace run returns its length.
    #[test]
    fn test_whitespaces() {
        let text = chars("  \t\nx");
        let mut position = 0;
        assert_eq!(read_whitespaces(&text, &mut position), 4);
        assert_eq!(position, 4);
        assert_eq!(read_whitespaces(&text, &mut position), 0);
    }

    /// Quote-sensitive single-codepoint readers.
    #[test]
    fn test_quote_helpers() {
        let text = chars(r#"a\""#);
        let mut position = 0;
        assert_eq!(read_non_double_quote_non_backslash(&text, &mut position), Some('a'));
        assert_eq!(read_non_double_quote_non_backslash(&text, &mut position), None);
        assert_eq!(read_non_double_quote(&text, &mut position), Some('\\'));
        assert_eq!(read_non_double_quote(&text, &mut position), None);
        assert!(read_double_quote(&text, &mut position));
        assert_eq!(position, 3);
    }

    /// Every simple escape resolves; unknown escapes leave the cursor alone.
    #[test]
    fn test_simple_escapes() {
        let cases = [
            ('a', '\u{07}'),
            ('b', '\u{08}'),
            ('f', '\u{0C}'),
            ('n', '\n'),
            ('r', '\r'),
            ('t', '\t'),
            ('\\', '\\'),
            ('\'', '\''),
            ('"', '"'),
            ('?', '?'),
        ];
        for (escape, resolved) in cases {
            let text = vec!['\\', escape];
            let mut position = 0;
            assert_eq!(read_simple_escape_sequence(&text, &mut position), Some(resolved));
            assert_eq!(position, 2);
        }

        let text = chars(r"\z");
        let mut position = 0;
        assert_eq!(read_simple_escape_sequence(&text, &mut position), None);
        assert_eq!(position, 0);
    }

    /// The unicode escape takes exactly six hex digits, either case.
    #[test]
    fn test_unicode_escape() {
        let text = chars(r"\x000041");
        let mut position = 0;
        assert_eq!(read_unicode_escape_sequence(&text, &mut position), Some('A'));
        assert_eq!(position, 8);

        let text = chars(r"\x00004A");
        let mut position = 0;
        assert_eq!(read_unicode_escape_sequence(&text, &mut position), Some('J'));

        // Five digits: fail, cursor unmoved.
        let text = chars(r"\x00041 ");
        let mut position = 0;
        assert_eq!(read_unicode_escape_sequence(&text, &mut position), None);
        assert_eq!(position, 0);

        // Out of Unicode scalar range.
        let text = chars(r"\xFFFFFF");
        let mut position = 0;
        assert_eq!(read_unicode_escape_sequence(&text, &mut position), None);
        assert_eq!(position, 0);
    }

    /// `"a\nb\x000041"` parses to `[0x61, 0x0A, 0x62, 0x41]` with the cursor
    /// past the closing quote.
    #[test]
    fn test_string_literal() {
        let text = chars(r#""a\nb\x000041""#);
        let mut position = 0;
        let literal = read_string_literal(&text, &mut position).unwrap();
        assert_eq!(literal, vec!['\u{61}', '\u{0A}', '\u{62}', '\u{41}']);
        assert_eq!(position, text.len());
    }

    /// Unterminated or ill-escaped literals fail with the cursor unmoved.
    #[test]
    fn test_string_literal_failures() {
        for broken in [r#""abc"#, r#""a\z""#, r#"abc"#, r#""a\x12""#] {
            let text = chars(broken);
            let mut position = 0;
            assert_eq!(read_string_literal(&text, &mut position), None, "{broken}");
            assert_eq!(position, 0, "{broken}");
        }
    }

    /// Unescaping then re-escaping reproduces the source codepoints.
    #[test]
    fn test_literal_round_trip() {
        fn escape(codepoint: char) -> Vec<char> {
            match codepoint {
                '\u{07}' => chars(r"\a"),
                '\u{08}' => chars(r"\b"),
                '\u{0C}' => chars(r"\f"),
                '\n' => chars(r"\n"),
                '\r' => chars(r"\r"),
                '\t' => chars(r"\t"),
                '\\' => chars(r"\\"),
                '"' => chars("\\\""),
                c if (c as u32) < 0x20 => {
                    format!("\\x{:06X}", c as u32).chars().collect()
                }
                c => vec![c],
            }
        }

        let source = chars(r#""tab\there\nand \x01F600 \"quoted\"""#);
        let mut position = 0;
        let literal = read_string_literal(&source, &mut position).unwrap();

        let mut rebuilt = vec!['"'];
        for &c in &literal {
            rebuilt.extend(escape(c));
        }
        rebuilt.push('"');

        let mut position = 0;
        let reparsed = read_string_literal(&rebuilt, &mut position).unwrap();
        assert_eq!(reparsed, literal);
    }
}
