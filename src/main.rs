use social_downloader::config::Config;

#[tokio::main]
async fn main() {
    if let Err(error) = dotenvy::dotenv()
        && !error.not_found()
    {
        eprintln!("Could not load .env file: {error}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "social_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = social_downloader::run(Config::from_env()).await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}
