/// Entry point for CLI binary
use inquisidor::frontend;

fn main() {
    match frontend::cli_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
