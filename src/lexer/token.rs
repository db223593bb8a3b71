//! [Token] model produced by the lexer
//!
//! Every token carries its 1-based source line and the byte offset of its
//! first character, so that the fix-up pass can re-lex from the exact spot
//! where a malformed token was found.

use std::fmt;

use crate::assembler::node::Section;

/// Severity of an in-stream diagnostic token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// The closed set of token variants the lexer can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// A mnemonic such as `MOV` or `BNE` (trailing whitespace trimmed)
    Instruction(String),
    /// A register name: `R0`..`R12`, `SP`, `LR`, `PC` (case preserved)
    Register(String),
    /// An identifier
    Label(String),
    /// `=name`: the address of a label, used by wide loads
    LoadLabel(String),
    /// `#value`: an ordinary immediate operand
    ImmediateValue(i32),
    /// `=value`: a wide literal for `LDR Rd, =value`
    LoadImmediateValue(i32),
    /// One of `,` `:` `[` `]` `{` `}`
    Separator(char),
    /// `.text`, `.bss` or `.data`
    Section(Section),
    /// `.ascii`, `.asciz` or `.string` (lower-cased directive text)
    AsciiAsciz(String),
    /// `.global`
    Global,
    /// `.align n` with n in {1, 2, 4, 8}; no effect on layout
    Align(u8),
    /// `.skip n`: reserve n bytes of zeroed data
    Skip(u32),
    /// `.cpu ...`; payload ignored
    Cpu,
    /// `// ...`, `; ...` or `/* ... */`
    Comment,
    /// The raw text between double quotes, escapes not yet applied
    StringLiteral(String),
    NewLine,
    /// A character no other variant matched; resolved by the fix-up pass
    Mismatch(String),
    /// A diagnostic produced during lexing, reported before assembly
    Error(String, Severity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// 1-based source line of the first character
    pub line: usize,
    /// Byte offset of the first character in the source text
    pub offset: usize,
}

impl Token {
    pub fn new(kind: TokenKind, line: usize, offset: usize) -> Token {
        Token { kind, line, offset }
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self.kind, TokenKind::Mismatch(_))
    }

    /// How the token is named in diagnostics
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::NewLine => "newline".to_string(),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Token {
    /// The canonical literal form of the token, used by diagnostics
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TokenKind::Instruction(name) => write!(f, "{}", name),
            TokenKind::Register(name) => write!(f, "{}", name),
            TokenKind::Label(name) => write!(f, "{}", name),
            TokenKind::LoadLabel(name) => write!(f, "={}", name),
            TokenKind::ImmediateValue(value) => write!(f, "#{}", value),
            TokenKind::LoadImmediateValue(value) => write!(f, "={}", value),
            TokenKind::Separator(c) => write!(f, "{}", c),
            TokenKind::Section(Section::Text) => write!(f, ".text"),
            TokenKind::Section(Section::Bss) => write!(f, ".bss"),
            TokenKind::Section(Section::Data) => write!(f, ".data"),
            TokenKind::AsciiAsciz(directive) => write!(f, "{}", directive),
            TokenKind::Global => write!(f, ".global"),
            TokenKind::Align(n) => write!(f, ".align {}", n),
            TokenKind::Skip(n) => write!(f, ".skip {}", n),
            TokenKind::Cpu => write!(f, ".cpu"),
            TokenKind::Comment => Ok(()),
            TokenKind::StringLiteral(raw) => write!(f, "\"{}\"", raw),
            TokenKind::NewLine => writeln!(f),
            TokenKind::Mismatch(raw) => write!(f, "{}", raw),
            TokenKind::Error(..) => Ok(()),
        }
    }
}

/// Render a syntax diagnostic in the shape the reporting layer expects.
/// The `$fileName$` placeholder is substituted when the message is printed.
pub fn syntax_message(severity: Severity, line: Option<usize>, message: &str) -> String {
    let kind = match severity {
        Severity::Warning => "Syntax warning",
        Severity::Error => "Syntax error",
    };
    match (severity, line) {
        (_, Some(line)) => format!("File \"$fileName$\", line {}\n\t{}: {}", line, kind, message),
        (Severity::Error, None) => {
            format!("File \"$fileName$\", at the last line\n\t{}: {}", kind, message)
        }
        (Severity::Warning, None) => format!("File \"$fileName$\"\n\t{}: {}", kind, message),
    }
}

/// Parse the numeric part of an immediate (`#`/`=` already stripped):
/// decimal, `0x` hexadecimal or `0b` binary.
fn int_value(text: &str, line: usize) -> Result<i32, String> {
    let text = text.trim_matches([' ', '\t']);
    if text.is_empty() {
        return Err(syntax_message(
            Severity::Error,
            Some(line),
            "no value after '#' or '='",
        ));
    }
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2)
    } else {
        text.parse::<i64>()
    };
    match parsed {
        Ok(value) => Ok(value as u32 as i32),
        Err(_) => Err(syntax_message(
            Severity::Error,
            Some(line),
            &format!("Invalid immediate value: '{}'", text),
        )),
    }
}

/// Parse a quoted character literal (`'a'`, `'\n'`, ...) into its code.
fn char_value(text: &str, line: usize) -> Result<i32, String> {
    let text = text.trim_matches([' ', '\t']);
    if text.is_empty() {
        return Err(syntax_message(
            Severity::Error,
            Some(line),
            "no value after '#' or '='",
        ));
    }
    if text.matches('\'').count() < 2 {
        return Err(syntax_message(
            Severity::Error,
            Some(line),
            "immediate character declaration was not closed (\"'\" missing)",
        ));
    }
    let inner = text.trim_matches('\'');
    let mut chars = inner.chars();
    let value = match (chars.next(), chars.next(), chars.next()) {
        (Some('\\'), Some(escape), None) => match escape {
            'b' => 0x08,
            'f' => 0x0C,
            'n' => '\n' as i32,
            'r' => '\r' as i32,
            't' => '\t' as i32,
            '"' => '"' as i32,
            '\\' => '\\' as i32,
            '0' => 0,
            other => other as i32,
        },
        (Some(c), None, _) => c as i32,
        _ => {
            return Err(syntax_message(
                Severity::Error,
                Some(line),
                &format!("More than one character in the quotes '{}'", inner),
            ));
        }
    };
    Ok(value)
}

/// Build an `ImmediateValue` / `LoadImmediateValue` token from the matched
/// text (sigil included); malformed values become in-stream error tokens.
pub fn immediate_token(text: &str, load: bool, line: usize, offset: usize) -> Token {
    let body = &text[1..];
    let parsed = if body.contains('\'') {
        char_value(body, line)
    } else {
        int_value(body, line)
    };
    let kind = match parsed {
        Ok(value) if load => TokenKind::LoadImmediateValue(value),
        Ok(value) => TokenKind::ImmediateValue(value),
        Err(message) => TokenKind::Error(message, Severity::Error),
    };
    Token::new(kind, line, offset)
}
