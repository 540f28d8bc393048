pub fn print_startup_banner(self_debug: bool) {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;31m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                            _       _
 _ __ ___ _ __   ___  _ __| |_  __| |
| '__/ _ \ '_ \ / _ \| '__| __|/ _` |
| | |  __/ |_) | (_) | |  | |_| (_| |
|_|  \___| .__/ \___/|_|   \__|\__,_|
         |_|                         "#;
    const APP_DESCRIPTION: &str =
        "Report definitions, scheduled executions and rendered results over NXCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("REPORTD_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    if self_debug {
        println!("{DIM_GRAY}self-debug run: scratch storage, scenario client attached{RESET}");
    }
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
