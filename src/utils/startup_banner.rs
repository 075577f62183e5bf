use std::net::SocketAddr;

pub fn print_startup_banner(bound_addr: Option<SocketAddr>) {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;110m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
        _           _      _
 __   _(_)____   __| | ___| |__  _   _  __ _
 \ \ / / |_  /  / _` |/ _ \ '_ \| | | |/ _` |
  \ V /| |/ /  | (_| |  __/ |_) | |_| | (_| |
   \_/ |_/___|  \__,_|\___|_.__/ \__,_|\__, |
                                       |___/ "#;
    const APP_DESCRIPTION: &str =
        "Live variable snapshots from debuggers and hooks, collected over TCP.";
    const PROTOCOL_NOTICE: &str =
        "One frame per connection: u32 big-endian length + JSON {identity, vars}, then close.";

    println!("{BANNER_COLOR}{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("VIZDEBUG_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    if let Some(addr) = bound_addr {
        println!("Serving on {addr}");
    }
    println!("{DIM_GRAY}{PROTOCOL_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
