//! Converts the token stream into sectioned memory images
//!
//! The assembler is a single pass with section state: `.text`, `.bss` and
//! `.data` directives switch the section every following cell lands in.
//! Labels are recorded against the current section's next cell index and
//! resolved to absolute addresses once layout is final (see
//! [`crate::machine::generate_machine_state`]).
//!
//! Failures never abort the pass: each one occupies an [`Node::Error`]
//! cell in the current section, the cursor resynchronizes to the next
//! line, and every error is reported in source order afterwards.

pub mod instructions;
pub mod node;

use instructions::{TokenCursor, decode, too_few_tokens, unexpected_token};
use node::{Label, Node, Provenance, Section};

use crate::lexer::token::{Severity, Token, TokenKind, syntax_message};

/// The output of [assemble]: one node vector per section, label
/// definitions still in `(section, cell index)` form, and the identifiers
/// named by `.global`.
#[derive(Debug, Clone, Default)]
pub struct ProgramContext {
    pub text: Vec<Node>,
    pub bss: Vec<Node>,
    pub data: Vec<Node>,
    pub labels: Vec<Label>,
    pub globals: Vec<String>,
}

impl ProgramContext {
    fn section_mut(&mut self, section: Section) -> &mut Vec<Node> {
        match section {
            Section::Text => &mut self.text,
            Section::Bss => &mut self.bss,
            Section::Data => &mut self.data,
        }
    }

    /// All assemble-time error messages, in section order.
    pub fn error_messages(&self) -> Vec<String> {
        self.text
            .iter()
            .chain(&self.bss)
            .chain(&self.data)
            .filter_map(|node| match node {
                Node::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Assemble a fixed-up token stream. Lex-time error tokens must have been
/// reported (and hard errors gated on) by the caller.
pub fn assemble(tokens: &[Token]) -> ProgramContext {
    let mut context = ProgramContext::default();
    let mut section = Section::Text;
    let mut cur = TokenCursor::new(tokens);

    while let Some(head) = cur.next() {
        match &head.kind {
            TokenKind::Instruction(name) => {
                // a mnemonic followed by ':' is really a label definition
                if cur.peek().map(|t| &t.kind) == Some(&TokenKind::Separator(':')) {
                    cur.next();
                    let index = context.section_mut(section).len() as u32;
                    context.labels.push(Label::new(name.clone(), section, index));
                } else if section == Section::Bss {
                    let node = Node::Error {
                        message: syntax_message(
                            Severity::Error,
                            Some(head.line),
                            "Instructions should not be placed in BSS",
                        ),
                    };
                    cur.advance_to_newline();
                    context.section_mut(section).push(node);
                } else {
                    let mnemonic = name.trim().to_uppercase();
                    match decode(&mnemonic, head.line, &mut cur, section) {
                        Some(node) => context.section_mut(section).push(node),
                        None => {
                            let node = Node::Error {
                                message: syntax_message(
                                    Severity::Error,
                                    Some(head.line),
                                    &format!("Unsupported instruction: '{}'", name),
                                ),
                            };
                            cur.advance_to_newline();
                            context.section_mut(section).push(node);
                        }
                    }
                }
            }
            // registers are accepted as label names because the register
            // and label classes overlap in the lexer
            TokenKind::Label(name) | TokenKind::Register(name) => match cur.next() {
                None => {
                    let node = unexpected_token(head.line, "End of File", "':'");
                    context.section_mut(section).push(node);
                }
                Some(sep) if sep.kind == TokenKind::Separator(':') => {
                    let index = context.section_mut(section).len() as u32;
                    context.labels.push(Label::new(name.clone(), section, index));
                }
                Some(sep) => {
                    let node = unexpected_token(sep.line, &sep.describe(), "':'");
                    context.section_mut(section).push(node);
                }
            },
            TokenKind::Section(new_section) => section = *new_section,
            TokenKind::AsciiAsciz(directive) => {
                match string_directive(directive, head.line, &mut cur) {
                    Ok(words) => {
                        let cells = words.into_iter().map(|value| Node::Data {
                            value,
                            source: Provenance::Code,
                            section,
                            line: head.line,
                        });
                        context.section_mut(section).extend(cells);
                    }
                    Err(node) => context.section_mut(section).push(node),
                }
            }
            TokenKind::Global => match global_list(&mut cur, head.line) {
                Ok(names) => context.globals.extend(names),
                Err(node) => context.section_mut(section).push(node),
            },
            TokenKind::Skip(count) => {
                let cells = (0..count / 4).map(|_| Node::Data {
                    value: 0,
                    source: Provenance::Code,
                    section,
                    line: head.line,
                });
                context.section_mut(section).extend(cells);
                cur.advance_to_newline();
            }
            TokenKind::Align(_) | TokenKind::Cpu => cur.advance_to_newline(),
            TokenKind::Error(..) | TokenKind::NewLine | TokenKind::Comment => {}
            TokenKind::LoadLabel(_)
            | TokenKind::ImmediateValue(_)
            | TokenKind::LoadImmediateValue(_)
            | TokenKind::Separator(_)
            | TokenKind::StringLiteral(_)
            | TokenKind::Mismatch(_) => {
                let node = unexpected_token(head.line, &head.describe(), "End of line");
                context.section_mut(section).push(node);
            }
        }
    }
    context
}

/// Apply the string escape set and degrade each character to a byte.
fn unescape_bytes(raw: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            bytes.push((c as u32 & 0xFF) as u8);
            continue;
        }
        match chars.next() {
            Some('b') => bytes.push(0x08),
            Some('f') => bytes.push(0x0C),
            Some('n') => bytes.push(b'\n'),
            Some('r') => bytes.push(b'\r'),
            Some('t') => bytes.push(b'\t'),
            Some('"') => bytes.push(b'"'),
            Some('\\') => bytes.push(b'\\'),
            Some('0') => bytes.push(0),
            Some(other) => {
                bytes.push(b'\\');
                bytes.push((other as u32 & 0xFF) as u8);
            }
            None => bytes.push(b'\\'),
        }
    }
    bytes
}

/// Pack bytes MSB-first into big-endian words, zero-padding the last one.
fn pack_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = 0u32;
            for (lane, byte) in chunk.iter().enumerate() {
                word |= (*byte as u32) << (8 * (3 - lane));
            }
            word
        })
        .collect()
}

/// Decode `.ascii`/`.asciz`/`.string`: a comma-separated list of string
/// literals, NUL-terminated per string for `.asciz` and `.string`, packed
/// into words.
fn string_directive(
    directive: &str,
    line: usize,
    cur: &mut TokenCursor,
) -> Result<Vec<u32>, Node> {
    let terminate = directive == ".asciz" || directive == ".string";
    if cur.is_empty() {
        return Err(too_few_tokens(Some(line), &format!("{} directive", directive)));
    }

    let mut bytes = Vec::new();
    loop {
        let Some(token) = cur.next() else { break };
        match &token.kind {
            TokenKind::StringLiteral(raw) => {
                bytes.extend(unescape_bytes(raw));
                if terminate {
                    bytes.push(0);
                }
            }
            _ => {
                let node = unexpected_token(token.line, &token.describe(), "a string literal");
                cur.advance_to_newline();
                return Err(node);
            }
        }
        match cur.next() {
            None => break,
            Some(sep) if sep.kind == TokenKind::NewLine => break,
            Some(sep) if sep.kind == TokenKind::Separator(',') => {}
            Some(sep) => {
                let node = unexpected_token(sep.line, &sep.describe(), "','");
                cur.advance_to_newline();
                return Err(node);
            }
        }
    }
    Ok(pack_words(&bytes))
}

/// Decode the identifier list of `.global`. Instruction and register
/// tokens are accepted as identifiers for the same overlap reason as
/// label definitions.
fn global_list(cur: &mut TokenCursor, _line: usize) -> Result<Vec<String>, Node> {
    let mut names = Vec::new();
    loop {
        let Some(token) = cur.next() else { break };
        match &token.kind {
            TokenKind::Instruction(name)
            | TokenKind::Register(name)
            | TokenKind::Label(name) => names.push(name.clone()),
            _ => {
                let node = unexpected_token(token.line, &token.describe(), "a label");
                cur.advance_to_newline();
                return Err(node);
            }
        }
        match cur.next() {
            None => break,
            Some(sep) if sep.kind == TokenKind::NewLine => break,
            Some(sep) if sep.kind == TokenKind::Separator(',') => {}
            Some(sep) => {
                let node = unexpected_token(sep.line, &sep.describe(), "','");
                cur.advance_to_newline();
                return Err(node);
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::instructions::{ArithOp, CmpOp, Instruction, Offset, Op2};
    use super::*;
    use crate::lexer;
    use crate::machine::{Reg, Width};

    fn assemble_source(source: &str) -> ProgramContext {
        let tokens = lexer::fix_mismatches(lexer::lex(source), source);
        assemble(&tokens)
    }

    fn only_op(context: &ProgramContext) -> &Instruction {
        assert_eq!(context.text.len(), 1, "text: {:?}", context.text);
        match &context.text[0] {
            Node::Instruction { op, .. } => op,
            other => panic!("expected an instruction, got {}", other),
        }
    }

    #[test]
    fn labels_record_the_current_section_cell() {
        let context = assemble_source(
            ".text\n_start: MOV R0, #1\nloop: ADD R0, R0, #1\n.data\nmsg: .asciz \"Hi\"\n",
        );
        assert!(context.error_messages().is_empty());
        assert_eq!(context.labels.len(), 3);
        assert_eq!(context.labels[0], Label::new("_start", Section::Text, 0));
        assert_eq!(context.labels[1], Label::new("loop", Section::Text, 1));
        assert_eq!(context.labels[2], Label::new("msg", Section::Data, 0));
    }

    #[test]
    fn instruction_named_labels_are_recorded() {
        let context = assemble_source("add :\nMOV R0, #1\n");
        assert!(context.error_messages().is_empty());
        assert_eq!(context.labels, vec![Label::new("add", Section::Text, 0)]);
        assert_eq!(context.text.len(), 1);
    }

    #[test]
    fn register_named_labels_are_tolerated() {
        let context = assemble_source("r1: MOV R0, #1\n");
        assert!(context.error_messages().is_empty());
        assert_eq!(context.labels, vec![Label::new("r1", Section::Text, 0)]);
    }

    #[test]
    fn asciz_packs_msb_first_with_terminator() {
        let context = assemble_source(".data\nmsg: .asciz \"Hi\"\n");
        assert!(context.error_messages().is_empty());
        assert_eq!(context.data.len(), 1);
        match context.data[0] {
            Node::Data { value, .. } => assert_eq!(value, 0x4869_0000),
            ref other => panic!("expected data, got {}", other),
        }
    }

    #[test]
    fn ascii_concatenates_without_terminators() {
        let context = assemble_source(".data\n.ascii \"AB\", \"CD\"\n.asciz \"E\", \"F\"\n");
        let values: Vec<u32> = context
            .data
            .iter()
            .map(|node| match node {
                Node::Data { value, .. } => *value,
                other => panic!("expected data, got {}", other),
            })
            .collect();
        // "ABCD" then "E\0F\0"
        assert_eq!(values, vec![0x4142_4344, 0x4500_4600]);
    }

    #[test]
    fn string_escapes_are_applied() {
        let context = assemble_source(".data\n.ascii \"a\\n\\0b\"\n");
        match context.data[0] {
            Node::Data { value, .. } => assert_eq!(value, 0x610A_0062),
            ref other => panic!("expected data, got {}", other),
        }
    }

    #[test]
    fn skip_reserves_zeroed_words() {
        let context = assemble_source(".bss\nbuffer: .skip 16\n");
        assert!(context.error_messages().is_empty());
        assert_eq!(context.bss.len(), 4);
        assert!(context.bss.iter().all(|node| matches!(
            node,
            Node::Data {
                value: 0,
                source: Provenance::Code,
                ..
            }
        )));
    }

    #[test]
    fn global_collects_identifiers() {
        let context = assemble_source(".global _start, add, r1\n");
        assert_eq!(context.globals, vec!["_start", "add", "r1"]);
    }

    #[test]
    fn instructions_in_bss_are_rejected() {
        let context = assemble_source(".bss\nMOV R0, #1\n");
        let errors = context.error_messages();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Instructions should not be placed in BSS"));
    }

    #[test]
    fn unsupported_instructions_are_reported() {
        let context = assemble_source("LDM R0, {R1}\n");
        let errors = context.error_messages();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Unsupported instruction: 'LDM'"));
    }

    #[test]
    fn errors_keep_source_order_and_do_not_abort() {
        let context = assemble_source("MOV R0, #300\nMOV R1, #1\nSUB R0, R1, #9\n");
        let errors = context.error_messages();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("value must be below 255 but is 300"));
        assert!(errors[0].contains("line 1"));
        assert!(errors[1].contains("value must be below 7 but is 9"));
        assert!(errors[1].contains("line 3"));
        // the good instruction in between still assembled
        assert_eq!(
            context
                .text
                .iter()
                .filter(|n| matches!(n, Node::Instruction { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn sp_relative_word_offsets_scale_and_bias() {
        let context = assemble_source("LDR R1, [SP, #1]\n");
        assert_eq!(
            only_op(&context),
            &Instruction::Load {
                dest: Reg::parse("R1").unwrap(),
                base: Reg::SP,
                offset: Offset::Imm(8),
                width: Width::Word,
                sign_extend: false,
            }
        );
    }

    #[test]
    fn half_word_offsets_scale_by_two() {
        let context = assemble_source("LDRH R0, [R1, #3]\n");
        assert_eq!(
            only_op(&context),
            &Instruction::Load {
                dest: Reg::parse("R0").unwrap(),
                base: Reg::parse("R1").unwrap(),
                offset: Offset::Imm(6),
                width: Width::Half,
                sign_extend: false,
            }
        );
    }

    #[test]
    fn partial_widths_reject_sp_relative_immediates() {
        let context = assemble_source("STRB R0, [SP, #0]\n");
        let errors = context.error_messages();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Can only store a full word relative to SP or PC"));
    }

    #[test]
    fn load_literal_and_label_forms() {
        let context = assemble_source("LDR R0, =0x12345678\n");
        assert_eq!(
            only_op(&context),
            &Instruction::LoadLiteral {
                dest: Reg::parse("R0").unwrap(),
                value: 0x1234_5678,
            }
        );
        let context = assemble_source("LDR R0, =msg\n");
        assert_eq!(
            only_op(&context),
            &Instruction::LoadAddress {
                dest: Reg::parse("R0").unwrap(),
                label: "msg".to_string(),
            }
        );
        // sign-extending loads have no literal form
        let context = assemble_source("LDRSB R0, =5\n");
        assert_eq!(context.error_messages().len(), 1);
    }

    #[test]
    fn sp_immediates_scale_by_four() {
        let context = assemble_source("ADD SP, SP, #4\n");
        assert_eq!(
            only_op(&context),
            &Instruction::Arith {
                op: ArithOp::Add,
                dest: Reg::SP,
                lhs: Reg::SP,
                rhs: Op2::Imm(16),
            }
        );
        let context = assemble_source("ADD R0, SP, #4\n");
        assert_eq!(
            only_op(&context),
            &Instruction::Arith {
                op: ArithOp::Add,
                dest: Reg::parse("R0").unwrap(),
                lhs: Reg::SP,
                rhs: Op2::Imm(16),
            }
        );
    }

    #[test]
    fn two_operand_form_folds_the_destination() {
        let context = assemble_source("SUB R0, #8\n");
        assert_eq!(
            only_op(&context),
            &Instruction::Arith {
                op: ArithOp::Sub,
                dest: Reg::parse("R0").unwrap(),
                lhs: Reg::parse("R0").unwrap(),
                rhs: Op2::Imm(8),
            }
        );
    }

    #[test]
    fn compare_rejects_three_operands() {
        let context = assemble_source("CMP R0, R1, R2\n");
        let errors = context.error_messages();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("expected End of line"));

        let context = assemble_source("CMP R0, #2\n");
        assert_eq!(
            only_op(&context),
            &Instruction::Compare {
                op: CmpOp::Cmp,
                lhs: Reg::parse("R0").unwrap(),
                rhs: Op2::Imm(2),
            }
        );
    }

    #[test]
    fn push_lists_are_sorted_and_deduplicated() {
        let context = assemble_source("PUSH {R1, R0, R0, LR}\n");
        assert_eq!(
            only_op(&context),
            &Instruction::Push {
                regs: vec![
                    Reg::parse("R0").unwrap(),
                    Reg::parse("R1").unwrap(),
                    Reg::LR,
                ],
            }
        );
    }

    #[test]
    fn comments_do_not_disturb_decoding() {
        let context = assemble_source("MOV R0, #1 ; trailing\n// full line\nMOV R1, #2\n");
        assert!(context.error_messages().is_empty());
        assert_eq!(context.text.len(), 2);
    }
}
