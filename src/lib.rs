//! An ARMv6-M (Cortex-M0) assembly interpreter written in Rust, featuring:
//! - a regex-directed lexer with error recovery
//! - an assembler laying `.text`, `.bss` and `.data` out into one memory
//!   image
//! - a fetch-execute interpreter with stacktraces on runtime faults

pub mod assembler;
pub mod exec;
pub mod interpreter;
pub mod lexer;
pub mod logging;
pub mod machine;
