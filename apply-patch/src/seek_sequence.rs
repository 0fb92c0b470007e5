use std::borrow::Cow;

/// A line comparison rule. Both the file line and the pattern line are run
/// through `normalize` and the results compared for equality.
struct MatchStrategy {
    name: &'static str,
    normalize: fn(&str) -> Cow<'_, str>,
}

/// Ordered from strictest to loosest. The first strategy that produces a
/// match wins.
const STRATEGIES: &[MatchStrategy] = &[
    MatchStrategy {
        name: "exact",
        normalize: exact,
    },
    MatchStrategy {
        name: "trim_end",
        normalize: trim_end,
    },
    MatchStrategy {
        name: "trim",
        normalize: trim,
    },
    MatchStrategy {
        name: "unicode_punctuation",
        normalize: fold_punctuation,
    },
];

fn exact(s: &str) -> Cow<'_, str> {
    Cow::Borrowed(s)
}

fn trim_end(s: &str) -> Cow<'_, str> {
    Cow::Borrowed(s.trim_end())
}

fn trim(s: &str) -> Cow<'_, str> {
    Cow::Borrowed(s.trim())
}

/// Maps typographic dashes, quotes and exotic spaces to their ASCII
/// counterparts so that text copied through a rich editor still matches the
/// plain source file.
fn fold_punctuation(s: &str) -> Cow<'_, str> {
    let folded: String = s
        .chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => '-',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{00A0}' | '\u{2002}' | '\u{2003}' | '\u{2004}' | '\u{2005}' | '\u{2006}'
            | '\u{2007}' | '\u{2008}' | '\u{2009}' | '\u{200A}' | '\u{202F}' | '\u{205F}'
            | '\u{3000}' => ' ',
            other => other,
        })
        .collect();
    Cow::Owned(folded.trim().to_string())
}

fn matches_at(lines: &[String], pattern: &[String], at: usize, strategy: &MatchStrategy) -> bool {
    pattern
        .iter()
        .zip(&lines[at..at + pattern.len()])
        .all(|(pat, line)| (strategy.normalize)(line) == (strategy.normalize)(pat))
}

/// Attempt to find the sequence of `pattern` lines within `lines` beginning at or after `start`.
/// Returns the starting index of the match together with the name of the strategy that matched.
///
/// When `eof` is true the end-of-file position is tried first with every strategy, then the
/// regular forward search from `start` runs.
///
/// Special cases:
///  • Empty `pattern` → returns `Some(start)` (no-op match)
///  • `pattern.len() > lines.len()` → returns `None`
pub(crate) fn seek_sequence_with_strategy(
    lines: &[String],
    pattern: &[String],
    start: usize,
    eof: bool,
) -> Option<(usize, &'static str)> {
    if pattern.is_empty() {
        return Some((start, STRATEGIES[0].name));
    }
    if pattern.len() > lines.len() {
        return None;
    }
    let last_start = lines.len() - pattern.len();
    if eof && last_start >= start {
        for strategy in STRATEGIES {
            if matches_at(lines, pattern, last_start, strategy) {
                return Some((last_start, strategy.name));
            }
        }
    }
    for strategy in STRATEGIES {
        for i in start..=last_start {
            if matches_at(lines, pattern, i, strategy) {
                return Some((i, strategy.name));
            }
        }
    }
    None
}

pub(crate) fn seek_sequence(
    lines: &[String],
    pattern: &[String],
    start: usize,
    eof: bool,
) -> Option<usize> {
    seek_sequence_with_strategy(lines, pattern, start, eof).map(|(idx, _)| idx)
}
