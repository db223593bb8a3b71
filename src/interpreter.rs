//! The fetch-execute loop and the `parse` entry point
//!
//! [step] fetches the cell at PC, executes it, classifies any failure
//! (warnings print a stacktrace and continue, errors print and stop, the
//! stop sentinel stops silently) and advances PC by four. [run] iterates
//! until stop; [run_until] additionally evaluates a breakpoint predicate
//! before each fetch, which is the surface a debugger steps through.
//!
//! Stacktraces are reconstructed by scanning the stack for cells whose
//! provenance is the link register, instead of keeping a shadow call
//! stack: each such cell's value is the address of the call instruction
//! that pushed it.

use std::fmt;
use std::io::Write;

use crate::assembler::node::{Node, Provenance};
use crate::machine::{MachineState, Reg, RunError, RunErrorKind, generate_machine_state};
use crate::{assembler, exec, lexer, logging};

use crate::lexer::token::{Severity, TokenKind};

/// The originating file, split into lines for stacktrace rendering.
pub struct SourceText {
    pub file_name: String,
    pub lines: Vec<String>,
}

impl SourceText {
    pub fn new(file_name: &str, contents: &str) -> SourceText {
        SourceText {
            file_name: file_name.to_string(),
            lines: contents.lines().map(str::to_string).collect(),
        }
    }
}

/// What a single [step] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stopped,
}

/// Diagnostics that gated `parse`: every message already carries its file
/// and line context.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub messages: Vec<String>,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in &self.messages {
            writeln!(f, "{}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostics {}

/// Lex, fix up, assemble and lay out a source file. Lexer warnings are
/// printed immediately; lex errors abort before assembly and assemble
/// errors abort before layout, both reported in source order.
pub fn parse(
    file_name: &str,
    contents: &str,
    stack_size: u32,
    start_label: &str,
) -> Result<MachineState, Diagnostics> {
    let tokens = lexer::fix_mismatches(lexer::lex(contents), contents);

    let mut errors = Vec::new();
    for token in &tokens {
        if let TokenKind::Error(message, severity) = &token.kind {
            let message = message.replace("$fileName$", file_name);
            match severity {
                Severity::Warning => logging::warning(&message),
                Severity::Error => errors.push(message),
            }
        }
    }
    if !errors.is_empty() {
        return Err(Diagnostics { messages: errors });
    }

    let context = assembler::assemble(&tokens);
    let errors: Vec<String> = context
        .error_messages()
        .into_iter()
        .map(|message| message.replace("$fileName$", file_name))
        .collect();
    if !errors.is_empty() {
        return Err(Diagnostics { messages: errors });
    }

    Ok(generate_machine_state(
        context, stack_size, start_label, file_name,
    ))
}

/// One stacktrace frame for the instruction at `address`, or `None` when
/// the address does not resolve to an instruction cell.
fn stacktrace_frame(state: &MachineState, address: u32, source: &SourceText) -> Option<String> {
    match state.fetch_instruction(address).ok()? {
        Node::SystemCall { name, .. } => Some(format!("\tInternal function: {}", name)),
        node => {
            let line = node.line();
            let text = source
                .lines
                .get(line.wrapping_sub(1))
                .map(|l| l.trim())
                .unwrap_or("");
            Some(format!(
                "\tFile \"{}\", line {}:\n\t\t{}",
                source.file_name, line, text
            ))
        }
    }
}

/// Walk the stack between SP and `__STACKSIZE`, collect every cell tagged
/// with link-register provenance, and render one frame per entry plus the
/// PC frame (and the LR frame while the current subroutine has not
/// returned).
pub fn generate_stacktrace(state: &MachineState, error: &RunError, source: &SourceText) -> String {
    let mut frames = Vec::new();
    if let Some(frame) = stacktrace_frame(state, state.get_reg(Reg::PC), source) {
        frames.push(frame);
    }
    if !state.has_returned
        && let Some(frame) = stacktrace_frame(state, state.get_reg(Reg::LR), source)
    {
        frames.push(frame);
    }

    let from = (state.get_reg(Reg::SP) as usize / 4).min(state.memory.len());
    let to = (state.stack_size() as usize / 4).min(state.memory.len());
    if from < to {
        for cell in &state.memory[from..to] {
            if let Node::Data {
                value,
                source: Provenance::Register(Reg::LR),
                ..
            } = cell
                && let Some(frame) = stacktrace_frame(state, *value, source)
            {
                frames.push(frame);
            }
        }
    }

    let mut trace = String::from("Traceback (most recent call first):\n");
    for frame in frames {
        trace.push_str(&frame);
        trace.push('\n');
    }
    trace.push_str(&error.to_string());
    trace
}

/// Fetch, execute and classify one instruction, then advance PC.
pub fn step(state: &mut MachineState, source: &SourceText, out: &mut dyn Write) -> StepOutcome {
    let pc = state.get_reg(Reg::PC);
    let node = match state.fetch_instruction(pc) {
        Ok(node) => node.clone(),
        Err(error) => {
            logging::stacktrace(&generate_stacktrace(state, &error, source));
            return StepOutcome::Stopped;
        }
    };

    if let Err(error) = exec::execute(state, &node, out) {
        match error.kind {
            RunErrorKind::Stop => return StepOutcome::Stopped,
            RunErrorKind::Error => {
                logging::stacktrace(&generate_stacktrace(state, &error, source));
                return StepOutcome::Stopped;
            }
            RunErrorKind::Warning => {
                logging::stacktrace(&generate_stacktrace(state, &error, source));
            }
        }
    }

    // a subroutine returned when PC landed on LR; the stacktrace then
    // omits the LR frame
    let pc = state.get_reg(Reg::PC);
    if pc == state.get_reg(Reg::LR) {
        state.has_returned = true;
    }
    state.set_reg(Reg::PC, pc.wrapping_add(4));
    StepOutcome::Continue
}

/// Run until the program stops or faults.
pub fn run(state: &mut MachineState, source: &SourceText, out: &mut dyn Write) {
    while step(state, source, out) == StepOutcome::Continue {}
}

/// Run until `break_before` returns true for the cell about to execute,
/// or until the program stops. Returns true when stopped at a breakpoint.
pub fn run_until(
    state: &mut MachineState,
    source: &SourceText,
    out: &mut dyn Write,
    break_before: &dyn Fn(&Node) -> bool,
) -> bool {
    loop {
        let pc = state.get_reg(Reg::PC);
        if let Ok(node) = state.fetch_instruction(pc)
            && break_before(node)
        {
            return true;
        }
        if step(state, source, out) == StepOutcome::Stopped {
            return false;
        }
    }
}
