use clap::Parser;
use klack_cli::Cli;

fn main() {
    let cli = Cli::parse();
    match klack_cli::run_main(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("klack: {err:#}");
            std::process::exit(1);
        }
    }
}
