use std::io::Write;
use std::{env, fs, io, process};

use cm0sim::interpreter::{self, SourceText};
use cm0sim::logging;

const DEFAULT_STACK_SIZE: u32 = 1024;
const DEFAULT_START_LABEL: &str = "_start";

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 4 {
        eprintln!(
            "Usage: {} <program.asm> [stack-size] [start-label]",
            args[0]
        );
        process::exit(1);
    }

    let path = &args[1];
    let stack_size = match args.get(2) {
        Some(text) => match text.parse::<u32>() {
            Ok(size) if size % 4 == 0 => size,
            _ => {
                logging::error("the stack size must be a multiple of 4 bytes");
                process::exit(1);
            }
        },
        None => DEFAULT_STACK_SIZE,
    };
    let start_label = args
        .get(3)
        .map(String::as_str)
        .unwrap_or(DEFAULT_START_LABEL);

    let contents = fs::read_to_string(path).unwrap_or_else(|e| {
        logging::error(&format!("failed to read {}: {}", path, e));
        process::exit(1);
    });

    let mut state = interpreter::parse(path, &contents, stack_size, start_label)
        .unwrap_or_else(|diagnostics| {
            for message in &diagnostics.messages {
                logging::error(message);
            }
            process::exit(2);
        });

    let source = SourceText::new(path, &contents);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    interpreter::run(&mut state, &source, &mut out);
    let _ = out.flush();
}
