use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    home_ems::cli::run().await
}
