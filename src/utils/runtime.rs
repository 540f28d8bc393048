use std::process;

pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: reportd relies on POSIX signals and paths");
        process::exit(2);
    }
}

/// Prints the error and terminates with the configuration failure exit code.
pub fn exit_with(context: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("{context}: {error}");
    process::exit(2);
}
