#[tokio::main]
async fn main() {
    if let Err(e) = crank::cli::run_main().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
