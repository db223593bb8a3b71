//! Per-mnemonic decoding of the token stream into [Instruction] values
//!
//! Each decoder consumes the operand tokens of one instruction and either
//! produces an [`Node::Instruction`] cell carrying the decoded operands, or
//! synthesizes an [`Node::Error`] cell and resynchronizes the cursor to the
//! next line. Operand-range checks happen here, at assemble time.

use super::node::{Node, Section};
use crate::lexer::token::{Severity, Token, TokenKind, syntax_message};
use crate::machine::{Reg, StatusRegister, Width};

/// A register-or-immediate second operand. Immediates are already scaled
/// and masked by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op2 {
    Reg(Reg),
    Imm(u32),
}

/// The address offset of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    None,
    Reg(Reg),
    /// Byte offset, already scaled by the access width
    Imm(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Adc,
    Sub,
    Sbc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Eor,
    Orr,
    Bic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Cmp,
    Cmn,
    Tst,
}

/// Branch predicates over the status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
}

impl Condition {
    pub fn holds(self, status: &StatusRegister) -> bool {
        let StatusRegister { n, z, c, v } = *status;
        match self {
            Condition::Always => true,
            Condition::Eq => z,
            Condition::Ne => !z,
            Condition::Cs => c,
            Condition::Cc => !c,
            Condition::Mi => n,
            Condition::Pl => !n,
            Condition::Vs => v,
            Condition::Vc => !v,
            Condition::Hi => !z && c,
            Condition::Ls => !c || z,
            Condition::Ge => n == v,
            Condition::Lt => n != v,
            Condition::Gt => !z && n == v,
            Condition::Le => z || n != v,
        }
    }
}

/// A compiled instruction: operands decoded once, executed many times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Mov {
        dest: Reg,
        src: Op2,
        invert: bool,
    },
    /// `LDR Rd, =value`
    LoadLiteral {
        dest: Reg,
        value: u32,
    },
    /// `LDR Rd, =label`: the label's absolute address
    LoadAddress {
        dest: Reg,
        label: String,
    },
    Load {
        dest: Reg,
        base: Reg,
        offset: Offset,
        width: Width,
        sign_extend: bool,
    },
    Store {
        src: Reg,
        base: Reg,
        offset: Offset,
        width: Width,
    },
    /// Register list sorted ascending; stored in list order
    Push {
        regs: Vec<Reg>,
    },
    /// Register list sorted ascending; restored in reverse list order
    Pop {
        regs: Vec<Reg>,
    },
    Arith {
        op: ArithOp,
        dest: Reg,
        lhs: Reg,
        rhs: Op2,
    },
    Bitwise {
        op: BitOp,
        dest: Reg,
        lhs: Reg,
        rhs: Op2,
    },
    Shift {
        op: ShiftOp,
        dest: Reg,
        lhs: Reg,
        rhs: Op2,
    },
    Mul {
        dest: Reg,
        lhs: Reg,
        rhs: Op2,
    },
    Compare {
        op: CmpOp,
        lhs: Reg,
        rhs: Op2,
    },
    /// SXTH / SXTB / UXTH / UXTB
    Extend {
        dest: Reg,
        src: Reg,
        width: Width,
        signed: bool,
    },
    Branch {
        condition: Condition,
        label: String,
    },
    BranchLink {
        label: String,
    },
    /// BX / BLX
    BranchExchange {
        target: Reg,
        link: bool,
    },
}

/// A cursor over the token stream shared by the assembler and the
/// decoders. Decoders leave the cursor after the last token they consumed,
/// or past the next newline after an error.
pub struct TokenCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    pub fn new(tokens: &'a [Token]) -> TokenCursor<'a> {
        TokenCursor { tokens, pos: 0 }
    }

    pub fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    pub fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Advance to the first token after the next newline.
    pub fn advance_to_newline(&mut self) {
        while let Some(token) = self.next() {
            if token.kind == TokenKind::NewLine {
                break;
            }
        }
    }
}

pub(crate) fn unexpected_token(line: usize, contents: &str, expected: &str) -> Node {
    Node::Error {
        message: syntax_message(
            Severity::Error,
            Some(line),
            &format!("Unexpected token: '{}', expected {}", contents, expected),
        ),
    }
}

pub(crate) fn immediate_out_of_range(line: usize, value: u32, max: u32) -> Node {
    Node::Error {
        message: syntax_message(
            Severity::Error,
            Some(line),
            &format!(
                "Immediate value out of range: value must be below {} but is {}",
                max, value
            ),
        ),
    }
}

pub(crate) fn too_few_tokens(line: Option<usize>, what: &str) -> Node {
    Node::Error {
        message: syntax_message(
            Severity::Error,
            line,
            &format!("Too few tokens to finish the {}", what),
        ),
    }
}

/// Decode one instruction's operands. `None` means the mnemonic is
/// recognized by the lexer but not supported by this interpreter.
pub fn decode(
    mnemonic: &str,
    line: usize,
    cur: &mut TokenCursor,
    section: Section,
) -> Option<Node> {
    let node = match mnemonic {
        "MOV" => mov(cur, section, line, false),
        "MOVN" => mov(cur, section, line, true),

        "LDR" => load(cur, section, line, Width::Word, false),
        "LDRH" => load(cur, section, line, Width::Half, false),
        "LDRB" => load(cur, section, line, Width::Byte, false),
        "LDRSH" => load(cur, section, line, Width::Half, true),
        "LDRSB" => load(cur, section, line, Width::Byte, true),
        "STR" => store(cur, section, line, Width::Word),
        "STRH" => store(cur, section, line, Width::Half),
        "STRB" => store(cur, section, line, Width::Byte),

        "PUSH" => push_pop(cur, section, line, true),
        "POP" => push_pop(cur, section, line, false),

        "ADD" => arith(cur, section, line, ArithOp::Add, "ADD"),
        "ADC" => arith(cur, section, line, ArithOp::Adc, "ADC"),
        "SUB" => arith(cur, section, line, ArithOp::Sub, "SUB"),
        "SBC" => arith(cur, section, line, ArithOp::Sbc, "SBC"),
        "MUL" => mul(cur, section, line),

        "AND" => bitwise(cur, section, line, BitOp::And, "AND"),
        "EOR" => bitwise(cur, section, line, BitOp::Eor, "EOR"),
        "ORR" => bitwise(cur, section, line, BitOp::Orr, "ORR"),
        "BIC" => bitwise(cur, section, line, BitOp::Bic, "BIC"),

        "LSL" => shift(cur, section, line, ShiftOp::Lsl, "LSL"),
        "LSR" => shift(cur, section, line, ShiftOp::Lsr, "LSR"),
        "ASR" => shift(cur, section, line, ShiftOp::Asr, "ASR"),
        "ROR" => shift(cur, section, line, ShiftOp::Ror, "ROR"),

        "SXTH" => extend(cur, section, line, Width::Half, true, "SXTH"),
        "SXTB" => extend(cur, section, line, Width::Byte, true, "SXTB"),
        "UXTH" => extend(cur, section, line, Width::Half, false, "UXTH"),
        "UXTB" => extend(cur, section, line, Width::Byte, false, "UXTB"),

        "TST" => compare(cur, section, line, CmpOp::Tst, "TST"),
        "CMP" => compare(cur, section, line, CmpOp::Cmp, "CMP"),
        "CMN" => compare(cur, section, line, CmpOp::Cmn, "CMN"),

        "B" => branch(cur, section, line, Condition::Always),
        "BL" => branch_link(cur, section, line),
        "BX" => branch_exchange(cur, section, line, false),
        "BLX" => branch_exchange(cur, section, line, true),

        "BCC" | "BLO" => branch(cur, section, line, Condition::Cc),
        "BCS" | "BHS" => branch(cur, section, line, Condition::Cs),
        "BEQ" => branch(cur, section, line, Condition::Eq),
        "BNE" => branch(cur, section, line, Condition::Ne),
        "BMI" => branch(cur, section, line, Condition::Mi),
        "BPL" => branch(cur, section, line, Condition::Pl),
        "BVS" => branch(cur, section, line, Condition::Vs),
        "BVC" => branch(cur, section, line, Condition::Vc),
        "BHI" => branch(cur, section, line, Condition::Hi),
        "BLS" => branch(cur, section, line, Condition::Ls),
        "BGE" => branch(cur, section, line, Condition::Ge),
        "BLT" => branch(cur, section, line, Condition::Lt),
        "BGT" => branch(cur, section, line, Condition::Gt),
        "BLE" => branch(cur, section, line, Condition::Le),

        _ => return None,
    };
    Some(node)
}

/// A raw register-or-immediate operand before range checking.
#[derive(Debug, Clone, Copy)]
enum RawOperand {
    Reg(Reg),
    Imm(u32),
}

fn instruction_node(op: Instruction, section: Section, line: usize) -> Node {
    Node::Instruction { op, section, line }
}

fn take_token<'a>(
    cur: &mut TokenCursor<'a>,
    line: Option<usize>,
    what: &str,
) -> Result<&'a Token, Node> {
    cur.next()
        .ok_or_else(|| too_few_tokens(line, &format!("{} instruction", what)))
}

fn expect_register(cur: &mut TokenCursor, line: usize, what: &str) -> Result<Reg, Node> {
    let token = take_token(cur, Some(line), what)?;
    let reg = match &token.kind {
        TokenKind::Register(name) => Reg::parse(name),
        _ => None,
    };
    match reg {
        Some(reg) => Ok(reg),
        None => {
            let node = unexpected_token(token.line, &token.describe(), "a register");
            cur.advance_to_newline();
            Err(node)
        }
    }
}

fn expect_separator(
    cur: &mut TokenCursor,
    line: usize,
    what: &str,
    separator: char,
    expected: &str,
) -> Result<(), Node> {
    let token = take_token(cur, Some(line), what)?;
    if token.kind == TokenKind::Separator(separator) {
        Ok(())
    } else {
        let node = unexpected_token(token.line, &token.describe(), expected);
        cur.advance_to_newline();
        Err(node)
    }
}

fn mov(cur: &mut TokenCursor, section: Section, line: usize, invert: bool) -> Node {
    let name = if invert { "MOVN" } else { "MOV" };
    if cur.is_empty() {
        return too_few_tokens(None, &format!("{} instruction", name));
    }
    let dest = match expect_register(cur, line, name) {
        Ok(reg) => reg,
        Err(node) => return node,
    };
    if let Err(node) = expect_separator(cur, line, name, ',', "','") {
        return node;
    }
    let token = match take_token(cur, Some(line), name) {
        Ok(token) => token,
        Err(node) => return node,
    };
    let src = match &token.kind {
        TokenKind::Register(reg_name) => match Reg::parse(reg_name) {
            Some(reg) => Op2::Reg(reg),
            None => return unexpected_token(token.line, &token.describe(), "a register"),
        },
        TokenKind::ImmediateValue(value) => {
            let value = *value as u32;
            if value > 0xFF {
                return immediate_out_of_range(token.line, value, 0xFF);
            }
            Op2::Imm(value)
        }
        _ => {
            let node = unexpected_token(
                token.line,
                &token.describe(),
                "a register or an immediate value",
            );
            cur.advance_to_newline();
            return node;
        }
    };
    instruction_node(Instruction::Mov { dest, src, invert }, section, line)
}

fn extend(
    cur: &mut TokenCursor,
    section: Section,
    line: usize,
    width: Width,
    signed: bool,
    name: &str,
) -> Node {
    if cur.is_empty() {
        return too_few_tokens(None, &format!("{} instruction", name));
    }
    let dest = match expect_register(cur, line, name) {
        Ok(reg) => reg,
        Err(node) => return node,
    };
    if let Err(node) = expect_separator(cur, line, name, ',', "','") {
        return node;
    }
    let src = match expect_register(cur, line, name) {
        Ok(reg) => reg,
        Err(node) => return node,
    };
    instruction_node(
        Instruction::Extend {
            dest,
            src,
            width,
            signed,
        },
        section,
        line,
    )
}

/// Parse `Rd, <reg|imm>` or `Rd, Rn, <reg|imm>`, the shape shared by every
/// ALU instruction.
fn alu_operands(
    cur: &mut TokenCursor,
    line: usize,
    name: &str,
) -> Result<(Reg, RawOperand, Option<RawOperand>), Node> {
    if cur.is_empty() {
        return Err(too_few_tokens(None, &format!("{} instruction", name)));
    }
    let dest = expect_register(cur, line, name)?;
    expect_separator(cur, line, name, ',', "','")?;
    let second = alu_operand(cur, line, name)?;

    let third = match cur.peek() {
        Some(token) if token.kind == TokenKind::Separator(',') => {
            cur.next();
            Some(alu_operand(cur, line, name)?)
        }
        Some(token) if token.kind == TokenKind::NewLine => None,
        Some(token) if token.kind == TokenKind::Comment => None,
        None => None,
        Some(token) => {
            let node = unexpected_token(token.line, &token.describe(), "',' or End of line");
            cur.advance_to_newline();
            return Err(node);
        }
    };
    Ok((dest, second, third))
}

fn alu_operand(cur: &mut TokenCursor, line: usize, name: &str) -> Result<RawOperand, Node> {
    let token = take_token(cur, Some(line), name)?;
    match &token.kind {
        TokenKind::Register(reg_name) => match Reg::parse(reg_name) {
            Some(reg) => Ok(RawOperand::Reg(reg)),
            None => Err(unexpected_token(token.line, &token.describe(), "a register")),
        },
        TokenKind::ImmediateValue(value) => Ok(RawOperand::Imm(*value as u32)),
        _ => {
            let node = unexpected_token(
                token.line,
                &token.describe(),
                "a register or an immediate value",
            );
            cur.advance_to_newline();
            Err(node)
        }
    }
}

/// Fold the two-operand form into `(lhs, rhs)` with `lhs = dest`.
fn fold_operands(
    cur: &mut TokenCursor,
    dest: Reg,
    second: RawOperand,
    third: Option<RawOperand>,
    line: usize,
) -> Result<(Reg, RawOperand), Node> {
    match third {
        None => Ok((dest, second)),
        Some(third) => match second {
            RawOperand::Reg(lhs) => Ok((lhs, third)),
            RawOperand::Imm(value) => {
                let node = unexpected_token(line, &format!("#{}", value), "a register");
                cur.advance_to_newline();
                Err(node)
            }
        },
    }
}

fn arith(cur: &mut TokenCursor, section: Section, line: usize, op: ArithOp, name: &str) -> Node {
    let (dest, second, third) = match alu_operands(cur, line, name) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let (lhs, rhs) = match fold_operands(cur, dest, second, third, line) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let rhs = match rhs {
        RawOperand::Reg(reg) => Op2::Reg(reg),
        RawOperand::Imm(value) => {
            // immediate width depends on the operand shape
            let scaled = if dest == lhs {
                if dest == Reg::SP {
                    if value > 0x7F {
                        return immediate_out_of_range(line, value, 0x7F);
                    }
                    value * 4
                } else {
                    if value > 0xFF {
                        return immediate_out_of_range(line, value, 0xFF);
                    }
                    value
                }
            } else if lhs == Reg::SP && op == ArithOp::Add {
                if value > 0xFF {
                    return immediate_out_of_range(line, value, 0xFF);
                }
                value * 4
            } else {
                if value > 0b111 {
                    return immediate_out_of_range(line, value, 0b111);
                }
                value
            };
            Op2::Imm(scaled)
        }
    };
    instruction_node(Instruction::Arith { op, dest, lhs, rhs }, section, line)
}

fn checked_imm(rhs: RawOperand, line: usize, max: u32) -> Result<Op2, Node> {
    match rhs {
        RawOperand::Reg(reg) => Ok(Op2::Reg(reg)),
        RawOperand::Imm(value) => {
            if value > max {
                Err(immediate_out_of_range(line, value, max))
            } else {
                Ok(Op2::Imm(value))
            }
        }
    }
}

fn bitwise(cur: &mut TokenCursor, section: Section, line: usize, op: BitOp, name: &str) -> Node {
    let (dest, second, third) = match alu_operands(cur, line, name) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let (lhs, rhs) = match fold_operands(cur, dest, second, third, line) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let rhs = match checked_imm(rhs, line, 0xFF) {
        Ok(op2) => op2,
        Err(node) => return node,
    };
    instruction_node(Instruction::Bitwise { op, dest, lhs, rhs }, section, line)
}

fn shift(cur: &mut TokenCursor, section: Section, line: usize, op: ShiftOp, name: &str) -> Node {
    let (dest, second, third) = match alu_operands(cur, line, name) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let (lhs, rhs) = match fold_operands(cur, dest, second, third, line) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let rhs = match checked_imm(rhs, line, 0x1F) {
        Ok(op2) => op2,
        Err(node) => return node,
    };
    instruction_node(Instruction::Shift { op, dest, lhs, rhs }, section, line)
}

fn mul(cur: &mut TokenCursor, section: Section, line: usize) -> Node {
    let (dest, second, third) = match alu_operands(cur, line, "MUL") {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let (lhs, rhs) = match fold_operands(cur, dest, second, third, line) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    let rhs = match checked_imm(rhs, line, 0xFF) {
        Ok(op2) => op2,
        Err(node) => return node,
    };
    instruction_node(Instruction::Mul { dest, lhs, rhs }, section, line)
}

fn compare(cur: &mut TokenCursor, section: Section, line: usize, op: CmpOp, name: &str) -> Node {
    let (lhs, second, third) = match alu_operands(cur, line, name) {
        Ok(parts) => parts,
        Err(node) => return node,
    };
    if let Some(third) = third {
        let rendered = match third {
            RawOperand::Reg(reg) => format!(", {}", reg),
            RawOperand::Imm(value) => format!(", #{}", value),
        };
        return unexpected_token(line, &rendered, "End of line");
    }
    let rhs = match checked_imm(second, line, 0xFF) {
        Ok(op2) => op2,
        Err(node) => return node,
    };
    instruction_node(Instruction::Compare { op, lhs, rhs }, section, line)
}

/// Decode the bracketed operand of a load or store: `[Rn]`, `[Rn, Rm]` or
/// `[Rn, #imm]` with width-dependent immediate scaling.
fn address_operand(
    cur: &mut TokenCursor,
    line: usize,
    width: Width,
    name: &str,
    action: &str,
) -> Result<(Reg, Offset), Node> {
    let base = expect_register(cur, line, name)?;
    let token = take_token(cur, Some(line), name)?;
    match &token.kind {
        TokenKind::Separator(']') => Ok((base, Offset::None)),
        TokenKind::Separator(',') => {
            let operand = take_token(cur, Some(line), name)?;
            let offset = match &operand.kind {
                TokenKind::Register(reg_name) => match Reg::parse(reg_name) {
                    Some(reg) => Offset::Reg(reg),
                    None => {
                        return Err(unexpected_token(
                            operand.line,
                            &operand.describe(),
                            "a register",
                        ));
                    }
                },
                TokenKind::ImmediateValue(value) => {
                    let value = *value as u32;
                    if base == Reg::SP || base == Reg::PC {
                        if width != Width::Word {
                            return Err(Node::Error {
                                message: syntax_message(
                                    Severity::Error,
                                    Some(operand.line),
                                    &format!("Can only {} a full word relative to SP or PC", action),
                                ),
                            });
                        }
                        if value > 0xFF {
                            return Err(immediate_out_of_range(operand.line, value, 0xFF));
                        }
                        Offset::Imm(4 + value * 4)
                    } else {
                        if value > 0x1F {
                            return Err(immediate_out_of_range(operand.line, value, 0x1F));
                        }
                        let scale = match width {
                            Width::Word => 4,
                            Width::Half => 2,
                            Width::Byte => 1,
                        };
                        Offset::Imm(value * scale)
                    }
                }
                _ => {
                    let node = unexpected_token(
                        operand.line,
                        &operand.describe(),
                        "a register or an immediate value",
                    );
                    cur.advance_to_newline();
                    return Err(node);
                }
            };
            expect_separator(cur, line, name, ']', "']'")?;
            Ok((base, offset))
        }
        _ => {
            let node = unexpected_token(token.line, &token.describe(), "']' or ','");
            cur.advance_to_newline();
            Err(node)
        }
    }
}

fn load(
    cur: &mut TokenCursor,
    section: Section,
    line: usize,
    width: Width,
    sign_extend: bool,
) -> Node {
    if cur.is_empty() {
        return too_few_tokens(None, "LDR instruction");
    }
    let dest = match expect_register(cur, line, "LDR") {
        Ok(reg) => reg,
        Err(node) => return node,
    };
    if let Err(node) = expect_separator(cur, line, "LDR", ',', "','") {
        return node;
    }
    let token = match take_token(cur, Some(line), "LDR") {
        Ok(token) => token,
        Err(node) => return node,
    };
    match &token.kind {
        TokenKind::LoadImmediateValue(value) if width == Width::Word && !sign_extend => {
            instruction_node(
                Instruction::LoadLiteral {
                    dest,
                    value: *value as u32,
                },
                section,
                line,
            )
        }
        TokenKind::LoadLabel(label) if !sign_extend => instruction_node(
            Instruction::LoadAddress {
                dest,
                label: label.clone(),
            },
            section,
            line,
        ),
        TokenKind::Separator('[') => match address_operand(cur, line, width, "LDR", "load") {
            Ok((base, offset)) => instruction_node(
                Instruction::Load {
                    dest,
                    base,
                    offset,
                    width,
                    sign_extend,
                },
                section,
                line,
            ),
            Err(node) => node,
        },
        _ => {
            let node = unexpected_token(token.line, &token.describe(), "'['");
            cur.advance_to_newline();
            node
        }
    }
}

fn store(cur: &mut TokenCursor, section: Section, line: usize, width: Width) -> Node {
    if cur.is_empty() {
        return too_few_tokens(None, "STR instruction");
    }
    let src = match expect_register(cur, line, "STR") {
        Ok(reg) => reg,
        Err(node) => return node,
    };
    if let Err(node) = expect_separator(cur, line, "STR", ',', "','") {
        return node;
    }
    if let Err(node) = expect_separator(cur, line, "STR", '[', "'['") {
        return node;
    }
    match address_operand(cur, line, width, "STR", "store") {
        Ok((base, offset)) => instruction_node(
            Instruction::Store {
                src,
                base,
                offset,
                width,
            },
            section,
            line,
        ),
        Err(node) => node,
    }
}

/// Parse a brace-delimited register list, sorted ascending, deduplicated.
fn register_list(cur: &mut TokenCursor, line: usize, name: &str) -> Result<Vec<Reg>, Node> {
    if cur.is_empty() {
        return Err(too_few_tokens(None, &format!("{} instruction", name)));
    }
    expect_separator(cur, line, name, '{', "'{'")?;
    let mut regs = vec![expect_register(cur, line, name)?];
    loop {
        let token = take_token(cur, Some(line), name)?;
        match &token.kind {
            TokenKind::Separator(',') => regs.push(expect_register(cur, line, name)?),
            TokenKind::Separator('}') => break,
            _ => {
                let node = unexpected_token(token.line, &token.describe(), "',' or '}'");
                cur.advance_to_newline();
                return Err(node);
            }
        }
    }
    regs.sort_by_key(|reg| reg.index());
    regs.dedup();
    Ok(regs)
}

fn push_pop(cur: &mut TokenCursor, section: Section, line: usize, push: bool) -> Node {
    let name = if push { "PUSH" } else { "POP" };
    let regs = match register_list(cur, line, name) {
        Ok(regs) => regs,
        Err(node) => return node,
    };
    let op = if push {
        Instruction::Push { regs }
    } else {
        Instruction::Pop { regs }
    };
    instruction_node(op, section, line)
}

fn branch_target(cur: &mut TokenCursor, line: usize) -> Result<String, Node> {
    let token = take_token(cur, Some(line), "Branch")?;
    match &token.kind {
        TokenKind::Label(label) => Ok(label.clone()),
        _ => {
            let node = unexpected_token(token.line, &token.describe(), "a label");
            cur.advance_to_newline();
            Err(node)
        }
    }
}

fn branch(cur: &mut TokenCursor, section: Section, line: usize, condition: Condition) -> Node {
    if cur.is_empty() {
        return too_few_tokens(None, "Branch instruction");
    }
    match branch_target(cur, line) {
        Ok(label) => instruction_node(Instruction::Branch { condition, label }, section, line),
        Err(node) => node,
    }
}

fn branch_link(cur: &mut TokenCursor, section: Section, line: usize) -> Node {
    if cur.is_empty() {
        return too_few_tokens(None, "BL instruction");
    }
    match branch_target(cur, line) {
        Ok(label) => instruction_node(Instruction::BranchLink { label }, section, line),
        Err(node) => node,
    }
}

fn branch_exchange(cur: &mut TokenCursor, section: Section, line: usize, link: bool) -> Node {
    let name = if link { "BLX" } else { "BX" };
    if cur.is_empty() {
        return too_few_tokens(None, &format!("{} instruction", name));
    }
    match expect_register(cur, line, name) {
        Ok(target) => instruction_node(Instruction::BranchExchange { target, link }, section, line),
        Err(node) => node,
    }
}
