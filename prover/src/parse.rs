//! Sentence scanner: finds the next dot-terminated top-level unit.
//!
//! A sentence terminator is a `.` at nesting depth zero followed by
//! whitespace or end of input, so qualified names (`Nat.add`) and interval
//! notation (`1..2`) do not split sentences. `(* ... *)` comments nest;
//! string literals escape a quote by doubling it.

use qed_core::Span;

/// One scanned sentence: its span (leading trivia excluded) and where the
/// next scan resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceSpan {
    pub span: Span,
    pub next_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("unterminated comment (opened at offset {0})")]
    UnterminatedComment(usize),
    #[error("unterminated string (opened at offset {0})")]
    UnterminatedString(usize),
    #[error("incomplete sentence (no terminating '.')")]
    MissingTerminator(usize),
}

/// Scan the sentence starting at or after `offset`. `Ok(None)` means only
/// trivia remains.
pub fn scan_sentence(text: &str, offset: usize) -> Result<Option<SentenceSpan>, ScanError> {
    let bytes = text.as_bytes();
    let len = bytes.len();

    let mut i = offset;
    loop {
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i + 1 < len && bytes[i] == b'(' && bytes[i + 1] == b'*' {
            i = skip_block_comment(bytes, i)?;
        } else {
            break;
        }
    }
    if i >= len {
        return Ok(None);
    }

    let start = i;
    let mut in_string = false;
    let mut string_start = 0;
    let mut depth = 0usize;
    let mut comment_start = 0;
    while i < len {
        let b = bytes[i];
        if in_string {
            if b == b'"' {
                if i + 1 < len && bytes[i + 1] == b'"' {
                    i += 2;
                    continue;
                }
                in_string = false;
            }
            i += 1;
            continue;
        }
        if depth > 0 {
            if b == b'*' && i + 1 < len && bytes[i + 1] == b')' {
                depth -= 1;
                i += 2;
            } else if b == b'(' && i + 1 < len && bytes[i + 1] == b'*' {
                depth += 1;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        match b {
            b'"' => {
                in_string = true;
                string_start = i;
                i += 1;
            }
            b'(' if i + 1 < len && bytes[i + 1] == b'*' => {
                depth = 1;
                comment_start = i;
                i += 2;
            }
            b'.' if i + 1 >= len || bytes[i + 1].is_ascii_whitespace() => {
                return Ok(Some(SentenceSpan {
                    span: Span::new(start, i + 1),
                    next_offset: i + 1,
                }));
            }
            _ => i += 1,
        }
    }

    if in_string {
        Err(ScanError::UnterminatedString(string_start))
    } else if depth > 0 {
        Err(ScanError::UnterminatedComment(comment_start))
    } else {
        Err(ScanError::MissingTerminator(start))
    }
}

fn skip_block_comment(bytes: &[u8], open: usize) -> Result<usize, ScanError> {
    let len = bytes.len();
    let mut depth = 1usize;
    let mut i = open + 2;
    while i < len {
        if bytes[i] == b'(' && i + 1 < len && bytes[i + 1] == b'*' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && i + 1 < len && bytes[i + 1] == b')' {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return Ok(i);
            }
        } else {
            i += 1;
        }
    }
    Err(ScanError::UnterminatedComment(open))
}
