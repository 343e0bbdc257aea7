use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = tmsctl::Cli::parse();
    if let Err(err) = tmsctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
