//! Line-oriented G-code word scanner
//! Splits a single G-code line into letter/number words with span info.
//! Malformed numbers never fail the scan; they simply produce no word.

use std::borrow::Cow;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z])\s*([+-]?(?:\d+\.?\d*|\.\d+))").expect("word pattern is valid")
});

/// Span in the original line text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GCodeSpan {
    pub range: Range<usize>,
}

/// A single `<letter><number>` word, letter upper-cased.
#[derive(Debug, Clone, PartialEq)]
pub struct Word<'a> {
    pub letter: char,
    pub value: &'a str,
    pub span: GCodeSpan,
}

impl Word<'_> {
    /// Numeric value, `None` if it does not parse as a finite number.
    pub fn number(&self) -> Option<f64> {
        self.value.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    /// Integer command code (`G01` -> 1, `G1.0` -> 1); fractional codes such as `G38.2` yield `None`.
    pub fn code(&self) -> Option<u32> {
        let v = self.number()?;
        if v < 0.0 || v.fract() != 0.0 {
            return None;
        }
        Some(v as u32)
    }
}

/// Motion commands understood by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionCode {
    /// G0
    Rapid,
    /// G1
    Linear,
    /// G2
    ArcCw,
    /// G3
    ArcCcw,
}

impl MotionCode {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Rapid),
            1 => Some(Self::Linear),
            2 => Some(Self::ArcCw),
            3 => Some(Self::ArcCcw),
            _ => None,
        }
    }
}

/// True for lines that carry no command: blank, `;` comments and `(` comments.
pub fn is_blank_or_comment(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with(';') || line.starts_with('(')
}

/// Remove `(...)` and trailing `; ...` comments from a line.
/// An unclosed `(` comments out the rest of the line.
pub fn strip_comments(line: &str) -> Cow<'_, str> {
    if !line.contains(['(', ';']) {
        return Cow::Borrowed(line.trim());
    }
    let mut out = String::with_capacity(line.len());
    let mut in_paren = false;
    for c in line.chars() {
        match c {
            '(' if !in_paren => in_paren = true,
            ')' if in_paren => in_paren = false,
            ';' if !in_paren => break,
            _ if !in_paren => out.push(c),
            _ => {}
        }
    }
    Cow::Owned(out.trim().to_string())
}

/// Words of one line, in source order.
#[derive(Debug, Clone, Default)]
pub struct ParsedLine<'a> {
    pub words: Vec<Word<'a>>,
}

impl<'a> ParsedLine<'a> {
    /// Scan a comment-free line. Callers strip comments first.
    pub fn parse(line: &'a str) -> Self {
        let words = WORD_RE
            .captures_iter(line)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let letter = caps.get(1)?.as_str().chars().next()?.to_ascii_uppercase();
                let value = caps.get(2)?.as_str();
                Some(Word { letter, value, span: GCodeSpan { range: whole.range() } })
            })
            .collect();
        Self { words }
    }

    /// First parseable value for `letter`.
    pub fn get(&self, letter: char) -> Option<f64> {
        self.words
            .iter()
            .filter(|w| w.letter == letter)
            .find_map(Word::number)
    }

    /// The G0..G3 word on this line, if any. Other G codes are ignored.
    pub fn motion(&self) -> Option<MotionCode> {
        self.words
            .iter()
            .filter(|w| w.letter == 'G')
            .find_map(|w| w.code().and_then(MotionCode::from_code))
    }

    /// Motion code only when it is the first word of the line.
    pub fn leading_motion(&self) -> Option<MotionCode> {
        self.words
            .first()
            .filter(|w| w.letter == 'G' && w.span.range.start == 0)
            .and_then(Word::code)
            .and_then(MotionCode::from_code)
    }
}

/// Split a program into the command lines sent to the controller:
/// trimmed, comments removed, blank lines dropped.
pub fn program_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !is_blank_or_comment(line))
        .map(strip_comments)
        .filter(|line| !line.is_empty())
        .map(Cow::into_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_parsing() {
        let line = ParsedLine::parse("G1 X10.0 Y-20 z.5");
        let letters: Vec<char> = line.words.iter().map(|w| w.letter).collect();
        assert_eq!(letters, vec!['G', 'X', 'Y', 'Z']);
        assert_eq!(line.get('X'), Some(10.0));
        assert_eq!(line.get('Y'), Some(-20.0));
        assert_eq!(line.get('Z'), Some(0.5));
        assert_eq!(line.motion(), Some(MotionCode::Linear));
    }

    #[test]
    fn test_words_without_spaces() {
        let line = ParsedLine::parse("G02X5Y5I2.5J0");
        assert_eq!(line.motion(), Some(MotionCode::ArcCw));
        assert_eq!(line.get('I'), Some(2.5));
        assert_eq!(line.get('J'), Some(0.0));
    }

    #[test]
    fn test_malformed_axis_is_absent() {
        let line = ParsedLine::parse("G1 Xabc Y3");
        assert_eq!(line.get('X'), None);
        assert_eq!(line.get('Y'), Some(3.0));
    }

    #[test]
    fn test_non_motion_g_codes() {
        assert_eq!(ParsedLine::parse("G10 L20 P1 X0").motion(), None);
        assert_eq!(ParsedLine::parse("G21 G90").motion(), None);
        assert_eq!(ParsedLine::parse("G90 G0 X1").motion(), Some(MotionCode::Rapid));
        assert_eq!(ParsedLine::parse("G90 G0 X1").leading_motion(), None);
        assert_eq!(ParsedLine::parse("G38.2 Z-5").motion(), None);
    }

    #[test]
    fn test_comment_handling() {
        assert!(is_blank_or_comment("   "));
        assert!(is_blank_or_comment("; header"));
        assert!(is_blank_or_comment("(setup)"));
        assert!(!is_blank_or_comment("G0 X1 ; move"));
        assert_eq!(strip_comments("G0 X1 ; move"), "G0 X1");
        assert_eq!(strip_comments("G1 (cut) X2 (deep"), "G1  X2");
        assert_eq!(strip_comments("  M3 S1000  "), "M3 S1000");
    }

    #[test]
    fn test_program_lines() {
        let text = "; job\nG21\n\n(start)\nG0 X0 Y0 ; rapid\n  G1 X5 F300\n( note ) ; only comments\n";
        assert_eq!(program_lines(text), vec!["G21", "G0 X0 Y0", "G1 X5 F300"]);
    }
}
