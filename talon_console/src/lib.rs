//! CLI surface: a whitespace-tokenizing command dispatcher over
//! `talon_vfs`/`talon_pmm`/`talon_smp`/`talon_sched`/`talon_log`.
//!
//! Grounded on the teacher's `src/shell/mod.rs::execute_command` match
//! and `src/shell/commands.rs`'s one-function-per-command style. The
//! terminal line editor that turns keypresses into a line, and the pixel
//! rendering of output, stay external collaborators per spec.md's
//! Non-goals — this crate only needs a `write_line` callback, matching
//! the shape spec.md §4.I calls for ("only needs a `fn write_line(&str)`
//! callback injected by `kernel`").
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::format;
use alloc::string::ToString;
use talon_vfs::VfsOpenFlags;

/// Commands are tokenized by whitespace; at most this many arguments are
/// kept per spec.md §6 ("up to 16 arguments per command").
pub const MAX_ARGS: usize = 16;

/// Exit codes per spec.md §6: 0 on success, -1 on failure.
pub const EXIT_OK: i32 = 0;
pub const EXIT_ERR: i32 = -1;

/// Splits `line` on whitespace, keeping at most [`MAX_ARGS`] tokens
/// (trailing tokens beyond the cap are dropped, not merged back in).
fn tokenize(line: &str) -> heapless::Vec<&str, MAX_ARGS> {
    let mut out = heapless::Vec::new();
    for tok in line.split_whitespace() {
        if out.push(tok).is_err() {
            break;
        }
    }
    out
}

/// Runs one command line, writing any output through `out`. Returns
/// [`EXIT_OK`] or [`EXIT_ERR`]; never panics on malformed input — an
/// unknown command or a filesystem error prints a one-line failure
/// string and returns [`EXIT_ERR`], matching spec.md §7's "console
/// commands print a one-line failure string; the kernel continues to
/// run".
pub fn execute(line: &str, out: &mut dyn FnMut(&str)) -> i32 {
    let tokens = tokenize(line);
    let Some(&command) = tokens.first() else {
        return EXIT_OK;
    };
    let args = &tokens[1..];

    match command {
        "help" => {
            cmd_help(out);
            EXIT_OK
        }
        "clear" => {
            out("\x1b[2J");
            EXIT_OK
        }
        "memory" => {
            cmd_memory(out);
            EXIT_OK
        }
        "cpu" => {
            cmd_cpu(out);
            EXIT_OK
        }
        "log" => {
            cmd_log(out);
            EXIT_OK
        }
        "exit" => EXIT_OK,
        "fs_create" => cmd_fs_create(args, out),
        "fs_read" => cmd_fs_read(args, out),
        "fs_write" => cmd_fs_write(args, out),
        "fs_list" => cmd_fs_list(args, out),
        "fs_mkdir" => cmd_fs_mkdir(args, out),
        "fs_stat" => cmd_fs_stat(args, out),
        _ => {
            out(&format!("unknown command: {command}"));
            EXIT_ERR
        }
    }
}

fn cmd_help(out: &mut dyn FnMut(&str)) {
    out("available commands:");
    out("  help                       - this message");
    out("  clear                      - clear the screen");
    out("  memory                     - PMM totals");
    out("  cpu                        - SMP/APIC topology");
    out("  log                        - dump the log ring");
    out("  exit                       - leave the console");
    out("  fs_create <path> [content] - create a file");
    out("  fs_read <path>             - print a file's contents");
    out("  fs_write <path> <data>     - overwrite a file's contents");
    out("  fs_list [path]             - list a directory");
    out("  fs_mkdir <path>            - create a directory");
    out("  fs_stat <path>             - print size/type of a path");
}

fn cmd_memory(out: &mut dyn FnMut(&str)) {
    let stats = talon_pmm::stats();
    out(&format!(
        "total: {} bytes  free: {} bytes  used: {} bytes",
        stats.total_bytes, stats.free_bytes, stats.used_bytes
    ));
}

fn cmd_cpu(out: &mut dyn FnMut(&str)) {
    let topo = talon_smp::detect_topology();
    out(&format!(
        "vendor: {:?}  logical processors: {}  running: {}  tasks: {}",
        topo.vendor,
        topo.logical_processor_count,
        talon_smp::running_cpu_count(),
        talon_sched::task_count(),
    ));
}

fn cmd_log(out: &mut dyn FnMut(&str)) {
    for entry in talon_log::LOGGER.drain() {
        out(&format!(
            "[{:>8}] {:<7} {}: {}",
            entry.timestamp,
            talon_log::level_str(entry.level),
            entry.subsystem,
            entry.message
        ));
    }
}

fn cmd_fs_create(args: &[&str], out: &mut dyn FnMut(&str)) -> i32 {
    let Some(&path) = args.first() else {
        out("fs_create: missing path");
        return EXIT_ERR;
    };
    let content = if args.len() > 1 { args[1..].join(" ") } else { alloc::string::String::new() };

    let fd = match talon_vfs::open(path, VfsOpenFlags::create_write()) {
        Ok(fd) => fd,
        Err(e) => {
            out(&format!("fs_create: {path}: {e:?}"));
            return EXIT_ERR;
        }
    };
    if !content.is_empty() {
        if let Err(e) = talon_vfs::write(fd, content.as_bytes()) {
            out(&format!("fs_create: {path}: {e:?}"));
            let _ = talon_vfs::close(fd);
            return EXIT_ERR;
        }
    }
    let _ = talon_vfs::close(fd);
    EXIT_OK
}

fn cmd_fs_read(args: &[&str], out: &mut dyn FnMut(&str)) -> i32 {
    let Some(&path) = args.first() else {
        out("fs_read: missing path");
        return EXIT_ERR;
    };
    let fd = match talon_vfs::open(path, VfsOpenFlags::read_only()) {
        Ok(fd) => fd,
        Err(e) => {
            out(&format!("fs_read: {path}: {e:?}"));
            return EXIT_ERR;
        }
    };
    let mut buf = [0u8; 4096];
    let result = talon_vfs::read(fd, &mut buf);
    let _ = talon_vfs::close(fd);
    match result {
        Ok(n) => {
            out(&core::str::from_utf8(&buf[..n]).unwrap_or("<binary data>").to_string());
            EXIT_OK
        }
        Err(e) => {
            out(&format!("fs_read: {path}: {e:?}"));
            EXIT_ERR
        }
    }
}

fn cmd_fs_write(args: &[&str], out: &mut dyn FnMut(&str)) -> i32 {
    let Some(&path) = args.first() else {
        out("fs_write: missing path");
        return EXIT_ERR;
    };
    if args.len() < 2 {
        out("fs_write: missing data");
        return EXIT_ERR;
    }
    let data = args[1..].join(" ");

    let fd = match talon_vfs::open(path, VfsOpenFlags::read_write()) {
        Ok(fd) => fd,
        Err(e) => {
            out(&format!("fs_write: {path}: {e:?}"));
            return EXIT_ERR;
        }
    };
    let result = talon_vfs::write(fd, data.as_bytes());
    let _ = talon_vfs::close(fd);
    match result {
        Ok(_) => EXIT_OK,
        Err(e) => {
            out(&format!("fs_write: {path}: {e:?}"));
            EXIT_ERR
        }
    }
}

fn cmd_fs_list(args: &[&str], out: &mut dyn FnMut(&str)) -> i32 {
    let path = args.first().copied().unwrap_or("/");
    match talon_vfs::getdents(path) {
        Ok(names) => {
            for name in names {
                out(&name);
            }
            EXIT_OK
        }
        Err(e) => {
            out(&format!("fs_list: {path}: {e:?}"));
            EXIT_ERR
        }
    }
}

fn cmd_fs_mkdir(args: &[&str], out: &mut dyn FnMut(&str)) -> i32 {
    let Some(&path) = args.first() else {
        out("fs_mkdir: missing path");
        return EXIT_ERR;
    };
    match talon_vfs::mkdir(path) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            out(&format!("fs_mkdir: {path}: {e:?}"));
            EXIT_ERR
        }
    }
}

fn cmd_fs_stat(args: &[&str], out: &mut dyn FnMut(&str)) -> i32 {
    let Some(&path) = args.first() else {
        out("fs_stat: missing path");
        return EXIT_ERR;
    };
    match talon_vfs::stat(path) {
        Ok(st) => {
            out(&format!(
                "{path}: {} size={} links={}",
                if st.is_dir { "dir" } else { "file" },
                st.size,
                st.links_count
            ));
            EXIT_OK
        }
        Err(e) => {
            out(&format!("fs_stat: {path}: {e:?}"));
            EXIT_ERR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_vfs() {
        talon_vfs::init();
        talon_vfs::mount_memory("/").unwrap();
    }

    fn collect(line: &str) -> (i32, alloc::vec::Vec<alloc::string::String>) {
        let mut lines = alloc::vec::Vec::new();
        let code = execute(line, &mut |s| lines.push(s.to_string()));
        (code, lines)
    }

    #[test]
    fn unknown_command_fails_with_one_line() {
        let (code, lines) = collect("frobnicate");
        assert_eq!(code, EXIT_ERR);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("unknown command"));
    }

    #[test]
    fn help_lists_every_command_and_succeeds() {
        let (code, lines) = collect("help");
        assert_eq!(code, EXIT_OK);
        assert!(lines.iter().any(|l| l.contains("fs_stat")));
    }

    #[test]
    fn fs_create_then_read_round_trips() {
        fresh_vfs();
        let (code, _) = collect("fs_create /greeting hello console");
        assert_eq!(code, EXIT_OK);
        let (code, lines) = collect("fs_read /greeting");
        assert_eq!(code, EXIT_OK);
        assert_eq!(lines[0], "hello console");
    }

    #[test]
    fn fs_read_missing_file_fails() {
        fresh_vfs();
        let (code, lines) = collect("fs_read /nope");
        assert_eq!(code, EXIT_ERR);
        assert!(lines[0].contains("fs_read"));
    }

    #[test]
    fn fs_mkdir_then_list_then_stat() {
        fresh_vfs();
        assert_eq!(collect("fs_mkdir /dir").0, EXIT_OK);
        assert_eq!(collect("fs_create /dir/a").0, EXIT_OK);
        let (code, lines) = collect("fs_list /dir");
        assert_eq!(code, EXIT_OK);
        assert_eq!(lines, alloc::vec!["a".to_string()]);
        let (code, lines) = collect("fs_stat /dir");
        assert_eq!(code, EXIT_OK);
        assert!(lines[0].contains("dir"));
    }

    #[test]
    fn empty_line_is_a_no_op_success() {
        let (code, lines) = collect("   ");
        assert_eq!(code, EXIT_OK);
        assert!(lines.is_empty());
    }

    #[test]
    fn extra_args_beyond_cap_are_dropped_not_merged() {
        let tokens = tokenize("a b c d e f g h i j k l m n o p q r s");
        assert_eq!(tokens.len(), MAX_ARGS);
    }
}
