use periscope::error::AppError;

#[tokio::main]
async fn main() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(tracing_subscriber::EnvFilter::new)
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info,periscope=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = periscope::app::load_state()?;
    let addr: std::net::SocketAddr = state
        .config
        .listen_addr()
        .parse()
        .map_err(|err: std::net::AddrParseError| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "listen_invalid",
                err.to_string(),
            )
        })?;
    let app = periscope::app::build_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            err.to_string(),
        )
    })?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "serve_failed",
            err.to_string(),
        )
    })?;
    Ok(())
}
