//! Regex-directed lexer for Cortex-M0 assembly source
//!
//! A single longest-match alternation classifies every byte of the source
//! into one of the [TokenKind] variants; characters no class claims become
//! [`TokenKind::Mismatch`] tokens that the fix-up pass resolves afterwards,
//! either by synthesizing the missing terminator and re-lexing from the
//! failing offset, or by degrading the mismatch into an in-stream error.

pub mod token;

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

use crate::assembler::node::Section;
use token::{Severity, Token, TokenKind, syntax_message};

/// Mnemonics the lexer recognizes. The tail entries past `BVS` are decoded
/// by no instruction and assemble into "Unsupported instruction" errors.
const MNEMONICS: [&str; 55] = [
    "MOV", "MOVN", "LDR", "LDRH", "LDRB", "LDRSH", "LDRSB", "STR", "STRH", "STRB", "PUSH", "POP",
    "ADD", "ADC", "SUB", "SBC", "MUL", "AND", "EOR", "ORR", "BIC", "LSL", "LSR", "ASR", "ROR",
    "SXTH", "SXTB", "UXTH", "UXTB", "TST", "CMP", "CMN", "B", "BL", "BX", "BLX", "BCC", "BLO",
    "BCS", "BHS", "BEQ", "BGE", "BGT", "BHI", "BLE", "BLS", "BLT", "BMI", "BNE", "BPL", "BVC",
    "BVS", "LDM", "LDMIA", "STMIA",
];

const LABEL: &str = "[A-Za-z_][A-Za-z0-9_]*";

/// The named capture groups, in the order the alternation tries them.
const GROUPS: [&str; 18] = [
    "INSTRUCTION",
    "REGISTER",
    "LD_LABEL",
    "LABEL",
    "IMMED_VALUE",
    "LD_IMMED_VALUE",
    "ALIGN",
    "SKIP",
    "ASCII_ASCIZ",
    "SECTION",
    "CPU",
    "GLOBAL",
    "SEPARATOR",
    "COMMENT",
    "STRINGLITERAL",
    "IGNORE",
    "NEWLINE",
    "MISMATCH",
];

static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    let instructions = MNEMONICS
        .iter()
        .map(|mnemonic| format!("{}[ \t]", mnemonic))
        .collect::<Vec<_>>()
        .join("|");
    let immediate = |sigil: &str| {
        format!(
            "{s}[ \t]*0x[0-9a-f]+|{s}[ \t]*0b[01]+|{s}[ \t]*'(?:\\\\[0bfnrtv\"\\\\]|.)'|{s}[ \t]*[0-9]+",
            s = sigil
        )
    };
    let pattern = format!(
        concat!(
            "(?is)",
            "(?P<INSTRUCTION>{instructions})|",
            "(?P<REGISTER>(?:SP|LR|PC|R1[0-2]|R[0-9])\\b)|",
            "(?P<LD_LABEL>=[ \t]*{label})|",
            "(?P<LABEL>{label})|",
            "(?P<IMMED_VALUE>{immed})|",
            "(?P<LD_IMMED_VALUE>{ld_immed})|",
            "(?P<ALIGN>\\.align[ \t]+[1248])|",
            "(?P<SKIP>\\.skip[ \t]+[0-9]+)|",
            "(?P<ASCII_ASCIZ>\\.asciz|\\.ascii|\\.string)|",
            "(?P<SECTION>\\.text|\\.bss|\\.data)|",
            "(?P<CPU>\\.cpu[^\n]*)|",
            "(?P<GLOBAL>\\.global)|",
            "(?P<SEPARATOR>[,:\\[\\]{{}}])|",
            "(?P<COMMENT>;[^\n]*|//[^\n]*|/\\*.*?\\*/)|",
            "(?P<STRINGLITERAL>\".*?\")|",
            "(?P<IGNORE>[ \t\r]+)|",
            "(?P<NEWLINE>\n)|",
            "(?P<MISMATCH>.)",
        ),
        instructions = instructions,
        label = LABEL,
        immed = immediate("#"),
        ld_immed = immediate("="),
    );
    Regex::new(&pattern).expect("the token pattern is valid")
});

fn token_from_match(group: &str, text: &str, offset: usize, line: usize) -> Option<Token> {
    let kind = match group {
        "INSTRUCTION" => TokenKind::Instruction(text.trim_end().to_string()),
        "REGISTER" => TokenKind::Register(text.to_string()),
        "LD_LABEL" => TokenKind::LoadLabel(text[1..].trim_matches([' ', '\t']).to_string()),
        "LABEL" => TokenKind::Label(text.to_string()),
        "IMMED_VALUE" => return Some(token::immediate_token(text, false, line, offset)),
        "LD_IMMED_VALUE" => return Some(token::immediate_token(text, true, line, offset)),
        "ALIGN" => TokenKind::Align(text.chars().last().and_then(|c| c.to_digit(10)).unwrap_or(4) as u8),
        "SKIP" => TokenKind::Skip(text[5..].trim_matches([' ', '\t']).parse().unwrap_or(0)),
        "ASCII_ASCIZ" => TokenKind::AsciiAsciz(text.to_lowercase()),
        "SECTION" => match text.to_lowercase().as_str() {
            ".text" => TokenKind::Section(Section::Text),
            ".bss" => TokenKind::Section(Section::Bss),
            _ => TokenKind::Section(Section::Data),
        },
        "CPU" => TokenKind::Cpu,
        "GLOBAL" => TokenKind::Global,
        "SEPARATOR" => TokenKind::Separator(text.chars().next()?),
        "COMMENT" => TokenKind::Comment,
        "STRINGLITERAL" => TokenKind::StringLiteral(text[1..text.len() - 1].to_string()),
        "IGNORE" => return None,
        "NEWLINE" => TokenKind::NewLine,
        "MISMATCH" => TokenKind::Mismatch(text.to_string()),
        _ => return None,
    };
    Some(Token::new(kind, line, offset))
}

/// Lex the source from a byte offset onwards. Used by the fix-up pass to
/// redo lexing after a terminator has been synthesized.
pub fn lex_from(contents: &str, from: usize) -> Vec<Token> {
    let mut line = 1 + contents[..from].matches('\n').count();
    let mut tokens = Vec::new();
    for captures in TOKEN_REGEX.captures_iter(&contents[from..]) {
        let Some((group, matched)) = GROUPS
            .iter()
            .find_map(|group| captures.name(group).map(|m| (*group, m)))
        else {
            continue;
        };
        let text = matched.as_str();
        if let Some(token) = token_from_match(group, text, from + matched.start(), line) {
            tokens.push(token);
        }
        line += text.matches('\n').count();
    }
    tokens
}

/// Lex a whole source file.
pub fn lex(contents: &str) -> Vec<Token> {
    lex_from(contents, 0)
}

/// Resolve every [`TokenKind::Mismatch`] left by [lex]:
///
/// - an unterminated string or block comment gets its terminator
///   synthesized at end of file (with a warning token) and the source is
///   re-lexed from the failing offset;
/// - a malformed character immediate becomes an error token and the
///   offending tokens are consumed;
/// - anything else becomes an `Unknown token` error.
pub fn fix_mismatches(tokens: Vec<Token>, contents: &str) -> Vec<Token> {
    let mut source = contents.to_string();
    let mut queue: VecDeque<Token> = tokens.into();
    let mut fixed = Vec::new();

    while let Some(head) = queue.pop_front() {
        if !head.is_mismatch() {
            fixed.push(head);
            continue;
        }

        let prefix: Vec<char> = source[head.offset..].chars().take(4).collect();
        match prefix.as_slice() {
            ['"', ..] => {
                fixed.push(Token::new(
                    TokenKind::Error(
                        syntax_message(
                            Severity::Warning,
                            None,
                            "Unterminated string at end of file, '\"' inserted",
                        ),
                        Severity::Warning,
                    ),
                    head.line,
                    head.offset,
                ));
                source.push('"');
                queue = lex_from(&source, head.offset).into();
            }
            ['/', '*', ..] => {
                fixed.push(Token::new(
                    TokenKind::Error(
                        syntax_message(
                            Severity::Warning,
                            None,
                            "Multi-line comment opened, but not closed (*/ is missing)",
                        ),
                        Severity::Warning,
                    ),
                    head.line,
                    head.offset,
                ));
                source.push_str("*/");
                queue = lex_from(&source, head.offset).into();
            }
            ['#' | '=', '\'', rest @ ..] => {
                // a character immediate the immediate classes rejected:
                // the closing quote is missing
                let (shown, skipped) = match rest {
                    ['\\', escape] if "0tnrfv".contains(*escape) => (4, 3),
                    [_, ..] => (3, 2),
                    [] => (2, 1),
                };
                let quoted: String = prefix.iter().take(shown).collect();
                let message = if shown == 2 {
                    format!("No character found after \"{}\"", quoted)
                } else {
                    format!("No \"'\" found after \"{}\"", quoted)
                };
                fixed.push(Token::new(
                    TokenKind::Error(
                        syntax_message(Severity::Error, Some(head.line), &message),
                        Severity::Error,
                    ),
                    head.line,
                    head.offset,
                ));
                for _ in 0..skipped {
                    queue.pop_front();
                }
            }
            ['#' | '=', unknown, ..] => {
                fixed.push(Token::new(
                    TokenKind::Error(
                        syntax_message(
                            Severity::Error,
                            Some(head.line),
                            &format!("Unknown token: {}", unknown),
                        ),
                        Severity::Error,
                    ),
                    head.line,
                    head.offset,
                ));
            }
            [unknown, ..] => {
                fixed.push(Token::new(
                    TokenKind::Error(
                        syntax_message(
                            Severity::Error,
                            Some(head.line),
                            &format!("Unknown token: {}", unknown),
                        ),
                        Severity::Error,
                    ),
                    head.line,
                    head.offset,
                ));
            }
            [] => {}
        }
    }
    fixed
}
