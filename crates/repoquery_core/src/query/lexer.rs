//! Tokenizer for logical query text.

use crate::error::{RepoError, RepoResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Integer(i64),
    Real(f64),
    Str(String),
    Named(String),
    Positional(usize),
    Symbol(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub offset: usize,
}

impl Token {
    /// Case-insensitive keyword test.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.tok, Tok::Ident(ident) if ident.eq_ignore_ascii_case(keyword))
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self.tok, Tok::Symbol(s) if s == symbol)
    }
}

const SYMBOLS: &[&str] = &[
    "<>", "!=", "<=", ">=", "(", ")", ",", ".", "=", "<", ">", "+", "-", "*", "/",
];

pub(crate) fn syntax(declaration: &str, offset: usize, message: impl Into<String>) -> RepoError {
    RepoError::Syntax {
        declaration: declaration.to_string(),
        offset,
        message: message.into(),
    }
}

/// Splits `text` into tokens. `declaration` names the query in errors.
pub(crate) fn tokenize(declaration: &str, text: &str) -> RepoResult<Vec<Token>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        let start = index;

        if byte.is_ascii_whitespace() {
            index += 1;
            continue;
        }

        if byte.is_ascii_alphabetic() || byte == b'_' {
            while index < bytes.len() && (bytes[index].is_ascii_alphanumeric() || bytes[index] == b'_')
            {
                index += 1;
            }
            tokens.push(Token {
                tok: Tok::Ident(text[start..index].to_string()),
                offset: start,
            });
            continue;
        }

        if byte.is_ascii_digit() {
            while index < bytes.len() && bytes[index].is_ascii_digit() {
                index += 1;
            }
            let mut real = false;
            if index + 1 < bytes.len() && bytes[index] == b'.' && bytes[index + 1].is_ascii_digit() {
                real = true;
                index += 1;
                while index < bytes.len() && bytes[index].is_ascii_digit() {
                    index += 1;
                }
            }
            let literal = &text[start..index];
            let tok = if real {
                literal
                    .parse::<f64>()
                    .map(Tok::Real)
                    .map_err(|_| syntax(declaration, start, "invalid number"))?
            } else {
                literal
                    .parse::<i64>()
                    .map(Tok::Integer)
                    .map_err(|_| syntax(declaration, start, "integer out of range"))?
            };
            tokens.push(Token { tok, offset: start });
            continue;
        }

        match byte {
            b'\'' => {
                let mut value = String::new();
                index += 1;
                loop {
                    let Some(&next) = bytes.get(index) else {
                        return Err(syntax(declaration, start, "unterminated string literal"));
                    };
                    if next == b'\'' {
                        if bytes.get(index + 1) == Some(&b'\'') {
                            value.push('\'');
                            index += 2;
                            continue;
                        }
                        index += 1;
                        break;
                    }
                    let ch_len = utf8_len(next);
                    value.push_str(&text[index..index + ch_len]);
                    index += ch_len;
                }
                tokens.push(Token {
                    tok: Tok::Str(value),
                    offset: start,
                });
            }
            b':' => {
                index += 1;
                let name_start = index;
                while index < bytes.len()
                    && (bytes[index].is_ascii_alphanumeric() || bytes[index] == b'_')
                {
                    index += 1;
                }
                if name_start == index {
                    return Err(syntax(declaration, start, "expected parameter name after `:`"));
                }
                tokens.push(Token {
                    tok: Tok::Named(text[name_start..index].to_string()),
                    offset: start,
                });
            }
            b'?' => {
                index += 1;
                let digits_start = index;
                while index < bytes.len() && bytes[index].is_ascii_digit() {
                    index += 1;
                }
                let position = text[digits_start..index]
                    .parse::<usize>()
                    .ok()
                    .filter(|position| *position > 0)
                    .ok_or_else(|| {
                        syntax(declaration, start, "positional parameters are written ?1, ?2, ...")
                    })?;
                tokens.push(Token {
                    tok: Tok::Positional(position),
                    offset: start,
                });
            }
            _ => {
                let rest = &text[start..];
                let symbol = SYMBOLS
                    .iter()
                    .find(|symbol| rest.starts_with(**symbol))
                    .ok_or_else(|| syntax(declaration, start, "unexpected character"))?;
                index += symbol.len();
                tokens.push(Token {
                    tok: Tok::Symbol(*symbol),
                    offset: start,
                });
            }
        }
    }

    Ok(tokens)
}

fn utf8_len(first: u8) -> usize {
    match first {
        0xF0..=0xFF => 4,
        0xE0..=0xEF => 3,
        0xC0..=0xDF => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::{tokenize, Tok};
    use crate::error::RepoError;

    #[test]
    fn tokenizes_select_with_parameters() {
        let tokens = tokenize(
            "q",
            "select m from Member m where m.username = :username and m.age >= ?2",
        )
        .unwrap();
        assert!(tokens[0].is_keyword("SELECT"));
        assert!(tokens
            .iter()
            .any(|token| token.tok == Tok::Named("username".to_string())));
        assert!(tokens.iter().any(|token| token.tok == Tok::Positional(2)));
        assert!(tokens.iter().any(|token| token.is_symbol(">=")));
    }

    #[test]
    fn string_literals_unescape_quotes() {
        let tokens = tokenize("q", "'it''s'").unwrap();
        assert_eq!(tokens[0].tok, Tok::Str("it's".to_string()));
    }

    #[test]
    fn errors_carry_offsets() {
        match tokenize("q", "select m from Member m where m.age = ;").unwrap_err() {
            RepoError::Syntax { offset, .. } => assert_eq!(offset, 37),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(tokenize("q", "where m.username = 'open").is_err());
    }
}
