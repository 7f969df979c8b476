/// Log output is controlled through `RUST_LOG`; `WITHDRAWER_LOG_FORMAT=json`
/// switches to one JSON object per line.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let json = std::env::var("WITHDRAWER_LOG_FORMAT").is_ok_and(|format| format == "json");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}
