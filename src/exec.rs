//! Executes decoded instructions against a [MachineState]
//!
//! One dispatch over the [Instruction] sum type: operands were decoded and
//! range-checked at assemble time, so execution only reads registers,
//! touches memory through the machine's load/store protocol, and updates
//! the status flags through the ALU kernels below.

use std::io::Write;

use crate::assembler::instructions::{
    ArithOp, BitOp, CmpOp, Instruction, Offset, Op2, ShiftOp,
};
use crate::assembler::node::{Node, Syscall};
use crate::machine::{MachineState, Reg, RunError, StatusRegister, Width};

/// Execute one fetched cell. The final `PC += 4` advancement is the
/// interpreter loop's job, so branch targets are written as `address - 4`.
pub fn execute(
    state: &mut MachineState,
    node: &Node,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    match node {
        Node::Instruction { op, .. } => execute_op(state, op),
        Node::SystemCall { call, .. } => system_call(state, call, out),
        _ => Err(RunError::error("Loaded data is no instruction")),
    }
}

fn execute_op(state: &mut MachineState, op: &Instruction) -> Result<(), RunError> {
    match op {
        Instruction::Mov { dest, src, invert } => {
            let mut value = op2_value(state, *src);
            if *invert {
                value = !value;
            }
            state.set_reg(*dest, value);
            Ok(())
        }
        Instruction::LoadLiteral { dest, value } => {
            state.set_reg(*dest, *value);
            Ok(())
        }
        Instruction::LoadAddress { dest, label } => {
            let address = state.get_label_address(label)?;
            state.set_reg(*dest, address);
            Ok(())
        }
        Instruction::Load {
            dest,
            base,
            offset,
            width,
            sign_extend,
        } => {
            let address = state.get_reg(*base).wrapping_add(offset_value(state, *offset));
            state.load_register(address, *width, *sign_extend, *dest)
        }
        Instruction::Store {
            src,
            base,
            offset,
            width,
        } => {
            let address = state.get_reg(*base).wrapping_add(offset_value(state, *offset));
            state.store_register(address, *src, *width)
        }
        Instruction::Push { regs } => push(state, regs),
        Instruction::Pop { regs } => pop(state, regs),
        Instruction::Arith { op, dest, lhs, rhs } => {
            let a = state.get_reg(*lhs);
            let mut b = op2_value(state, *rhs) as u64;
            // ADC and SBC fold the carry into the second operand
            if matches!(op, ArithOp::Adc | ArithOp::Sbc) && state.status.c {
                b += 1;
            }
            let negate = matches!(op, ArithOp::Sub | ArithOp::Sbc);
            let result = arith_flags(&mut state.status, a, b, negate);
            state.set_reg(*dest, result);
            Ok(())
        }
        Instruction::Bitwise { op, dest, lhs, rhs } => {
            let a = state.get_reg(*lhs);
            let b = op2_value(state, *rhs);
            let result = match op {
                BitOp::And => a & b,
                BitOp::Eor => a ^ b,
                BitOp::Orr => a | b,
                BitOp::Bic => a & !b,
            };
            bit_flags(&mut state.status, result);
            state.set_reg(*dest, result);
            Ok(())
        }
        Instruction::Shift { op, dest, lhs, rhs } => {
            let a = state.get_reg(*lhs);
            let amount = op2_value(state, *rhs);
            let result = shift_flags(&mut state.status, a, amount, *op);
            state.set_reg(*dest, result);
            Ok(())
        }
        Instruction::Mul { dest, lhs, rhs } => {
            let result = state.get_reg(*lhs).wrapping_mul(op2_value(state, *rhs));
            state.status.n = result >> 31 == 1;
            state.status.z = result == 0;
            state.set_reg(*dest, result);
            Ok(())
        }
        Instruction::Compare { op, lhs, rhs } => {
            let a = state.get_reg(*lhs);
            let b = op2_value(state, *rhs);
            match op {
                CmpOp::Cmp => {
                    arith_flags(&mut state.status, a, b as u64, true);
                }
                CmpOp::Cmn => {
                    arith_flags(&mut state.status, a, b as u64, false);
                }
                CmpOp::Tst => bit_flags(&mut state.status, a & b),
            }
            Ok(())
        }
        Instruction::Extend {
            dest,
            src,
            width,
            signed,
        } => {
            let value = state.get_reg(*src);
            let extended = match (width, signed) {
                (Width::Half, true) => value as u16 as i16 as i32 as u32,
                (Width::Half, false) => value & 0xFFFF,
                (_, true) => value as u8 as i8 as i32 as u32,
                (_, false) => value & 0xFF,
            };
            state.set_reg(*dest, extended);
            Ok(())
        }
        Instruction::Branch { condition, label } => {
            if condition.holds(&state.status) {
                let address = state.get_label_address(label)?;
                state.set_reg(Reg::PC, address.wrapping_sub(4));
            }
            Ok(())
        }
        Instruction::BranchLink { label } => {
            let pc = state.get_reg(Reg::PC);
            state.set_reg(Reg::LR, pc);
            let address = state.get_label_address(label)?;
            state.set_reg(Reg::PC, address.wrapping_sub(4));
            state.has_returned = false;
            Ok(())
        }
        Instruction::BranchExchange { target, link } => {
            if *link {
                let pc = state.get_reg(Reg::PC);
                state.set_reg(Reg::LR, pc);
            }
            let address = state.get_reg(*target);
            state.set_reg(Reg::PC, address.wrapping_sub(4));
            state.has_returned = false;
            Ok(())
        }
    }
}

fn op2_value(state: &MachineState, op2: Op2) -> u32 {
    match op2 {
        Op2::Reg(reg) => state.get_reg(reg),
        Op2::Imm(value) => value,
    }
}

fn offset_value(state: &MachineState, offset: Offset) -> u32 {
    match offset {
        Offset::None => 0,
        Offset::Reg(reg) => state.get_reg(reg),
        Offset::Imm(value) => value,
    }
}

/// The flag-setting add/subtract kernel shared by ADD, ADC, SUB, SBC, CMP
/// and CMN. `b` is the already carry-folded second operand; `negate`
/// replaces it with its two's complement. C is the 33rd bit of the
/// unbounded sum, V the two's-complement overflow.
fn arith_flags(status: &mut StatusRegister, a: u32, b: u64, negate: bool) -> u32 {
    let b_eff: u64 = if negate {
        (!(b as u32)).wrapping_add(1) as u64
    } else {
        b
    };
    let out = a as u64 + b_eff;
    let out32 = out as u32;
    let bit31 = out32 >> 31;
    let sign_a = a >> 31;
    let sign_b = ((b_eff >> 31) & 1) as u32;
    status.v = sign_a == sign_b && sign_b != bit31;
    status.c = (out >> 32) & 1 == 1;
    status.n = bit31 == 1;
    status.z = out32 == 0;
    out32
}

/// The bitwise kernel: N and Z from the result, C and V cleared.
fn bit_flags(status: &mut StatusRegister, result: u32) {
    status.n = result >> 31 == 1;
    status.z = result == 0;
    status.c = false;
    status.v = false;
}

/// The shift kernel: N and Z from the result, C from the last bit shifted
/// out (preserved for a zero shift count), V untouched.
fn shift_flags(status: &mut StatusRegister, a: u32, amount: u32, op: ShiftOp) -> u32 {
    let result = match op {
        ShiftOp::Lsl => {
            if amount == 0 {
                a
            } else if amount <= 32 {
                let wide = (a as u64) << amount;
                status.c = (wide >> 32) & 1 == 1;
                wide as u32
            } else {
                status.c = false;
                0
            }
        }
        ShiftOp::Lsr => {
            if amount == 0 {
                a
            } else if amount <= 32 {
                status.c = (a >> (amount - 1)) & 1 == 1;
                if amount == 32 { 0 } else { a >> amount }
            } else {
                status.c = false;
                0
            }
        }
        ShiftOp::Asr => {
            if amount == 0 {
                a
            } else if amount < 32 {
                status.c = (a >> (amount - 1)) & 1 == 1;
                ((a as i32) >> amount) as u32
            } else {
                status.c = a >> 31 == 1;
                if a >> 31 == 1 { u32::MAX } else { 0 }
            }
        }
        ShiftOp::Ror => {
            // rotates through the low five bits of the count
            let rotated = a.rotate_right(amount & 0x1F);
            if amount != 0 {
                status.c = rotated >> 31 == 1;
            }
            rotated
        }
    };
    status.n = result >> 31 == 1;
    status.z = result == 0;
    result
}

fn push(state: &mut MachineState, regs: &[Reg]) -> Result<(), RunError> {
    let stack_size = state.get_label_address("__STACKSIZE")?;
    for &reg in regs {
        let new_sp = state.get_reg(Reg::SP).wrapping_sub(4);
        if new_sp > stack_size.wrapping_sub(4) {
            return Err(RunError::error("Stack overflow"));
        }
        state.store_register(new_sp, reg, Width::Word)?;
        state.set_reg(Reg::SP, new_sp);
    }
    Ok(())
}

fn pop(state: &mut MachineState, regs: &[Reg]) -> Result<(), RunError> {
    let stack_size = state.get_label_address("__STACKSIZE")?;
    for &reg in regs.iter().rev() {
        let sp = state.get_reg(Reg::SP);
        if sp >= stack_size {
            return Err(RunError::error(
                "All stack entries have been pop'ed already",
            ));
        }
        state.load_register(sp, Width::Word, false, reg)?;
        state.set_reg(Reg::SP, sp + 4);
    }
    Ok(())
}

fn write_error(error: std::io::Error) -> RunError {
    RunError::error(format!("failed to write program output: {}", error))
}

/// Return from a synthetic routine: `MOV PC, LR`. The loop's `+4` then
/// resumes at the instruction after the call site.
fn return_to_caller(state: &mut MachineState) {
    let lr = state.get_reg(Reg::LR);
    state.set_reg(Reg::PC, lr);
}

fn system_call(
    state: &mut MachineState,
    call: &Syscall,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    match call {
        Syscall::PrintChar => {
            let r0 = state.get_reg(Reg::R0);
            let c = char::from_u32(r0).unwrap_or(char::REPLACEMENT_CHARACTER);
            write!(out, "{}", c).map_err(write_error)?;
            return_to_caller(state);
            Ok(())
        }
        Syscall::PrintInt => {
            writeln!(out, "{}", state.get_reg(Reg::R0)).map_err(write_error)?;
            return_to_caller(state);
            Ok(())
        }
        Syscall::Startup(label) => {
            let pc = state.get_reg(Reg::PC);
            state.set_reg(Reg::LR, pc);
            let address = state
                .get_label_address(label)
                .map_err(|_| RunError::error(format!("Unknown startup label: {}", label)))?;
            state.set_reg(Reg::PC, address.wrapping_sub(4));
            state.has_returned = false;
            Ok(())
        }
        Syscall::Stop => Err(RunError::stop()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::instructions::Condition;
    use crate::assembler::node::{Label, Provenance, Section};
    use std::collections::HashMap;

    fn r(index: u8) -> Reg {
        Reg::numbered(index).unwrap()
    }

    fn state_with_stack(stack_words: usize) -> MachineState {
        let memory = (0..stack_words)
            .map(|_| Node::Data {
                value: 0,
                source: Provenance::Setup,
                section: Section::Bss,
                line: 0,
            })
            .collect();
        let stack_size = stack_words as u32 * 4;
        let mut labels = HashMap::new();
        labels.insert(
            "__STACKSIZE".to_string(),
            Label::new("__STACKSIZE", Section::Text, stack_size),
        );
        let mut state = MachineState {
            registers: [0; 16],
            status: StatusRegister::default(),
            memory,
            labels,
            has_returned: true,
            file_name: "test.asm".to_string(),
        };
        state.set_reg(Reg::SP, stack_size);
        state
    }

    fn run(state: &mut MachineState, op: Instruction) -> Result<(), RunError> {
        execute_op(state, &op)
    }

    fn arith(state: &mut MachineState, op: ArithOp, dest: Reg, lhs: Reg, rhs: Op2) {
        run(state, Instruction::Arith { op, dest, lhs, rhs }).unwrap();
    }

    #[test]
    fn sub_sets_borrow_free_carry() {
        let mut state = state_with_stack(0);
        state.set_reg(r(0), 5);
        state.set_reg(r(1), 3);
        arith(&mut state, ArithOp::Sub, r(2), r(0), Op2::Reg(r(1)));
        assert_eq!(state.get_reg(r(2)), 2);
        let StatusRegister { n, z, c, v } = state.status;
        assert!(!n && !z && c && !v);
    }

    #[test]
    fn sub_below_zero_wraps_and_clears_carry() {
        let mut state = state_with_stack(0);
        state.set_reg(r(0), 3);
        arith(&mut state, ArithOp::Sub, r(0), r(0), Op2::Imm(5));
        assert_eq!(state.get_reg(r(0)), (-2i32) as u32);
        let StatusRegister { n, z, c, v } = state.status;
        assert!(n && !z && !c && !v);
    }

    #[test]
    fn add_sets_carry_and_overflow_independently() {
        let mut state = state_with_stack(0);
        // unsigned carry without signed overflow
        state.set_reg(r(0), u32::MAX);
        arith(&mut state, ArithOp::Add, r(0), r(0), Op2::Imm(1));
        assert_eq!(state.get_reg(r(0)), 0);
        assert!(state.status.c && state.status.z && !state.status.v);

        // signed overflow without unsigned carry
        state.set_reg(r(1), i32::MAX as u32);
        arith(&mut state, ArithOp::Add, r(1), r(1), Op2::Imm(1));
        assert_eq!(state.get_reg(r(1)), 0x8000_0000);
        assert!(state.status.v && state.status.n && !state.status.c);
    }

    #[test]
    fn adc_and_sbc_fold_the_carry() {
        let mut state = state_with_stack(0);
        state.status.c = true;
        state.set_reg(r(0), 1);
        arith(&mut state, ArithOp::Adc, r(2), r(0), Op2::Imm(1));
        assert_eq!(state.get_reg(r(2)), 3);

        state.status.c = true;
        state.set_reg(r(0), 5);
        arith(&mut state, ArithOp::Sbc, r(2), r(0), Op2::Imm(1));
        assert_eq!(state.get_reg(r(2)), 3);

        state.status.c = false;
        state.set_reg(r(0), 5);
        arith(&mut state, ArithOp::Sbc, r(2), r(0), Op2::Imm(1));
        assert_eq!(state.get_reg(r(2)), 4);
    }

    #[test]
    fn compare_updates_flags_without_writing() {
        let mut state = state_with_stack(0);
        state.set_reg(r(2), 2);
        run(
            &mut state,
            Instruction::Compare {
                op: CmpOp::Cmp,
                lhs: r(2),
                rhs: Op2::Imm(2),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(2)), 2);
        let StatusRegister { n, z, c, v } = state.status;
        assert!(z && c && !n && !v);
    }

    #[test]
    fn bitwise_kernels_clear_carry_and_overflow() {
        let mut state = state_with_stack(0);
        state.status.c = true;
        state.status.v = true;
        state.set_reg(r(0), 0xF0F0_F0F0);
        run(
            &mut state,
            Instruction::Bitwise {
                op: BitOp::And,
                dest: r(1),
                lhs: r(0),
                rhs: Op2::Imm(0xFF),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(1)), 0xF0);
        assert!(!state.status.c && !state.status.v && !state.status.n && !state.status.z);

        state.set_reg(r(2), 0xFF);
        run(
            &mut state,
            Instruction::Bitwise {
                op: BitOp::Bic,
                dest: r(3),
                lhs: r(2),
                rhs: Op2::Imm(0x0F),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(3)), 0xF0);
    }

    #[test]
    fn shifts_move_the_last_bit_into_carry() {
        let mut state = state_with_stack(0);
        state.set_reg(r(0), 0x8000_0001);
        run(
            &mut state,
            Instruction::Shift {
                op: ShiftOp::Lsl,
                dest: r(1),
                lhs: r(0),
                rhs: Op2::Imm(1),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(1)), 2);
        assert!(state.status.c);

        run(
            &mut state,
            Instruction::Shift {
                op: ShiftOp::Lsr,
                dest: r(1),
                lhs: r(0),
                rhs: Op2::Imm(1),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(1)), 0x4000_0000);
        assert!(state.status.c);

        run(
            &mut state,
            Instruction::Shift {
                op: ShiftOp::Asr,
                dest: r(1),
                lhs: r(0),
                rhs: Op2::Imm(4),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(1)), 0xF800_0000);
        assert!(state.status.n);

        run(
            &mut state,
            Instruction::Shift {
                op: ShiftOp::Ror,
                dest: r(1),
                lhs: r(0),
                rhs: Op2::Imm(1),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(1)), 0xC000_0000);
        assert!(state.status.c);
    }

    #[test]
    fn zero_shift_count_preserves_carry() {
        let mut state = state_with_stack(0);
        state.status.c = true;
        state.set_reg(r(0), 4);
        run(
            &mut state,
            Instruction::Shift {
                op: ShiftOp::Lsl,
                dest: r(0),
                lhs: r(0),
                rhs: Op2::Imm(0),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(0)), 4);
        assert!(state.status.c);
    }

    #[test]
    fn extends_narrow_and_widen() {
        let mut state = state_with_stack(0);
        state.set_reg(r(0), 0x1234_80FF);
        let cases = [
            (Width::Half, true, 0xFFFF_80FF),
            (Width::Half, false, 0x80FF),
            (Width::Byte, true, 0xFFFF_FFFF),
            (Width::Byte, false, 0xFF),
        ];
        for (width, signed, expected) in cases {
            run(
                &mut state,
                Instruction::Extend {
                    dest: r(1),
                    src: r(0),
                    width,
                    signed,
                },
            )
            .unwrap();
            assert_eq!(state.get_reg(r(1)), expected, "{:?}/{}", width, signed);
        }
    }

    #[test]
    fn mov_and_movn() {
        let mut state = state_with_stack(0);
        run(
            &mut state,
            Instruction::Mov {
                dest: r(0),
                src: Op2::Imm(0xFF),
                invert: false,
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(0)), 0xFF);
        run(
            &mut state,
            Instruction::Mov {
                dest: r(1),
                src: Op2::Reg(r(0)),
                invert: true,
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(r(1)), 0xFFFF_FF00);
    }

    #[test]
    fn push_then_pop_is_the_identity() {
        let mut state = state_with_stack(8);
        state.set_reg(r(0), 11);
        state.set_reg(r(1), 22);
        state.set_reg(Reg::LR, 33);
        let regs = vec![r(0), r(1), Reg::LR];
        let before_sp = state.get_reg(Reg::SP);

        run(&mut state, Instruction::Push { regs: regs.clone() }).unwrap();
        assert_eq!(state.get_reg(Reg::SP), before_sp - 12);

        state.set_reg(r(0), 0);
        state.set_reg(r(1), 0);
        state.set_reg(Reg::LR, 0);
        run(&mut state, Instruction::Pop { regs }).unwrap();

        assert_eq!(state.get_reg(Reg::SP), before_sp);
        assert_eq!(state.get_reg(r(0)), 11);
        assert_eq!(state.get_reg(r(1)), 22);
        assert_eq!(state.get_reg(Reg::LR), 33);
    }

    #[test]
    fn push_marks_link_register_provenance() {
        let mut state = state_with_stack(4);
        state.set_reg(Reg::LR, 0x40);
        run(&mut state, Instruction::Push { regs: vec![Reg::LR] }).unwrap();
        let sp = state.get_reg(Reg::SP) as usize;
        match state.memory[sp / 4] {
            Node::Data {
                value,
                source: Provenance::Register(Reg::LR),
                ..
            } => assert_eq!(value, 0x40),
            ref other => panic!("expected an LR-tagged cell, got {:?}", other),
        }
    }

    #[test]
    fn pushing_past_the_stack_bottom_overflows() {
        let mut state = state_with_stack(1);
        run(&mut state, Instruction::Push { regs: vec![r(0)] }).unwrap();
        let err = run(&mut state, Instruction::Push { regs: vec![r(0)] }).unwrap_err();
        assert_eq!(err.message, "Stack overflow");
    }

    #[test]
    fn popping_an_empty_stack_underflows() {
        let mut state = state_with_stack(2);
        let err = run(&mut state, Instruction::Pop { regs: vec![r(0)] }).unwrap_err();
        assert_eq!(err.message, "All stack entries have been pop'ed already");
    }

    #[test]
    fn branches_follow_the_condition() {
        let mut state = state_with_stack(0);
        state.labels.insert(
            "target".to_string(),
            Label::new("target", Section::Text, 0x80),
        );
        state.set_reg(Reg::PC, 0x40);
        state.status.z = true;

        run(
            &mut state,
            Instruction::Branch {
                condition: Condition::Ne,
                label: "target".to_string(),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(Reg::PC), 0x40, "not taken");

        run(
            &mut state,
            Instruction::Branch {
                condition: Condition::Eq,
                label: "target".to_string(),
            },
        )
        .unwrap();
        // written as target - 4; the loop re-adds 4
        assert_eq!(state.get_reg(Reg::PC), 0x7C, "taken");
    }

    #[test]
    fn branch_to_unknown_label_is_a_run_error() {
        let mut state = state_with_stack(0);
        let err = run(
            &mut state,
            Instruction::Branch {
                condition: Condition::Always,
                label: "nowhere".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(err.message, "Unknown label: nowhere");
    }

    #[test]
    fn branch_link_saves_the_return_address() {
        let mut state = state_with_stack(0);
        state.labels.insert(
            "sub".to_string(),
            Label::new("sub", Section::Text, 0x100),
        );
        state.set_reg(Reg::PC, 0x44);
        run(
            &mut state,
            Instruction::BranchLink {
                label: "sub".to_string(),
            },
        )
        .unwrap();
        assert_eq!(state.get_reg(Reg::LR), 0x44);
        assert_eq!(state.get_reg(Reg::PC), 0xFC);
        assert!(!state.has_returned);
    }

    #[test]
    fn print_syscalls_write_and_return() {
        let mut state = state_with_stack(0);
        state.set_reg(Reg::R0, 'A' as u32);
        state.set_reg(Reg::LR, 0x40);
        let mut out = Vec::new();
        system_call(&mut state, &Syscall::PrintChar, &mut out).unwrap();
        assert_eq!(out, b"A");
        assert_eq!(state.get_reg(Reg::PC), 0x40);

        let mut out = Vec::new();
        state.set_reg(Reg::R0, 1234);
        system_call(&mut state, &Syscall::PrintInt, &mut out).unwrap();
        assert_eq!(out, b"1234\n");
    }

    #[test]
    fn stop_sentinel_raises_stop() {
        let mut state = state_with_stack(0);
        let err = system_call(&mut state, &Syscall::Stop, &mut Vec::new()).unwrap_err();
        assert_eq!(err.kind, crate::machine::RunErrorKind::Stop);
    }
}
