use std::process::ExitCode;

fn main() -> ExitCode {
    loanflow_cli::run()
}
