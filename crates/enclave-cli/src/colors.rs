//! ANSI styling for `enclave` output and the one-line progress steps.

use std::io::{self, Write};

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const CYAN: &str = "\x1b[36m";
pub const RED: &str = "\x1b[31m";

/// Print `  ▶ <verb> <subject>... ` without a newline, ready for [`finish_step`].
pub fn begin_step(verb: &str, subject: &str) {
    print!("{CYAN}  ▶ {verb}{RESET} {subject}... ");
    io::stdout().flush().ok();
}

/// Close a step opened with [`begin_step`] with a check mark or a cross.
pub fn finish_step(ok: bool) {
    if ok {
        println!("{GREEN}✓{RESET}");
    } else {
        println!("{RED}✗{RESET}");
    }
}
