#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = swr::cli::run().await;
    std::process::exit(exit_code);
}
