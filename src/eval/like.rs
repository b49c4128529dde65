//! LIKE pattern matching with an optional escape character.
//!
//! `%` matches any character sequence (empty included), `_` matches
//! exactly one character, and a character preceded by the escape matches
//! itself. Matching is performed over characters, not bytes.

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tok {
    Literal(char),
    AnyOne,
    AnySeq,
}

/// Tokenize the pattern. A trailing escape character is malformed.
fn tokenize(pattern: &str, esc: Option<char>) -> Option<Vec<Tok>> {
    let mut toks = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == esc {
            match chars.next() {
                Some(next) => toks.push(Tok::Literal(next)),
                None => return None,
            }
        } else if c == '%' {
            toks.push(Tok::AnySeq);
        } else if c == '_' {
            toks.push(Tok::AnyOne);
        } else {
            toks.push(Tok::Literal(c));
        }
    }
    Some(toks)
}

/// Match `src` against `pattern`. Returns `None` when the pattern is
/// malformed (escape with nothing to escape).
pub(crate) fn string_like(src: &str, pattern: &str, esc: Option<char>) -> Option<bool> {
    let toks = tokenize(pattern, esc)?;
    let src: Vec<char> = src.chars().collect();

    // Iterative match with a single backtrack point per '%', the usual
    // glob-matching shape.
    let mut s = 0usize;
    let mut p = 0usize;
    let mut star: Option<(usize, usize)> = None; // (pattern pos after %, src pos)

    while s < src.len() {
        match toks.get(p) {
            Some(Tok::Literal(c)) if *c == src[s] => {
                s += 1;
                p += 1;
            }
            Some(Tok::AnyOne) => {
                s += 1;
                p += 1;
            }
            Some(Tok::AnySeq) => {
                star = Some((p + 1, s));
                p += 1;
            }
            _ => match star {
                Some((sp, ss)) => {
                    // Let the last % swallow one more source character.
                    star = Some((sp, ss + 1));
                    p = sp;
                    s = ss + 1;
                }
                None => return Some(false),
            },
        }
    }
    while toks.get(p) == Some(&Tok::AnySeq) {
        p += 1;
    }
    Some(p == toks.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert_eq!(string_like("abc", "abc", None), Some(true));
        assert_eq!(string_like("abc", "a%", None), Some(true));
        assert_eq!(string_like("abc", "%c", None), Some(true));
        assert_eq!(string_like("abc", "a_c", None), Some(true));
        assert_eq!(string_like("abc", "a_b", None), Some(false));
        assert_eq!(string_like("abc", "%", None), Some(true));
        assert_eq!(string_like("", "%", None), Some(true));
        assert_eq!(string_like("", "_", None), Some(false));
        assert_eq!(string_like("abcdef", "a%c%f", None), Some(true));
        assert_eq!(string_like("abcdef", "a%c%g", None), Some(false));
    }

    #[test]
    fn escape() {
        assert_eq!(string_like("50%", "50\\%", Some('\\')), Some(true));
        assert_eq!(string_like("50x", "50\\%", Some('\\')), Some(false));
        assert_eq!(string_like("a_b", "a\\_b", Some('\\')), Some(true));
        assert_eq!(string_like("axb", "a\\_b", Some('\\')), Some(false));
        // Escape escaping itself.
        assert_eq!(string_like("a\\b", "a\\\\b", Some('\\')), Some(true));
        // Trailing escape is malformed.
        assert_eq!(string_like("a", "a\\", Some('\\')), None);
    }

    #[test]
    fn greedy_backtracking() {
        assert_eq!(string_like("aaab", "%ab", None), Some(true));
        assert_eq!(string_like("aaab", "%_b", None), Some(true));
        assert_eq!(string_like("mississippi", "%iss%pi", None), Some(true));
        assert_eq!(string_like("mississippi", "%iss%x", None), Some(false));
    }
}
