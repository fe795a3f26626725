//! Repair for reasoning streams that arrive with every character doubled.
//!
//! Some OpenAI-compatible servers emit reasoning deltas as `我我喜喜欢欢`.
//! When collapsing adjacent duplicate pairs would remove more than 40% of the
//! text, the collapsed form is used instead. This is a lossy heuristic: a
//! legitimately repeated run such as `哈哈哈哈` is halved too.

use std::borrow::Cow;

const MIN_CHARS: usize = 4;
/// Collapse when more than 4/10 of the characters would be removed.
const COLLAPSE_NUM: usize = 4;
const COLLAPSE_DEN: usize = 10;

pub fn repair_doubled_chars(text: &str) -> Cow<'_, str> {
    let total = text.chars().count();
    if total < MIN_CHARS {
        return Cow::Borrowed(text);
    }

    let collapsed = collapse_pairs(text);
    let removed = total - collapsed.chars().count();

    if removed * COLLAPSE_DEN > total * COLLAPSE_NUM {
        Cow::Owned(collapsed)
    } else {
        Cow::Borrowed(text)
    }
}

fn collapse_pairs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if chars.peek() == Some(&c) {
            chars.next();
        }
    }
    out
}
