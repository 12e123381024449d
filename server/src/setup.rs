use sentry::ClientInitGuard;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};
use tracing_tree::HierarchicalLayer;

/// Start Sentry when `SENTRY_DSN` is set. Keep the guard alive for the whole
/// process so buffered events are flushed on exit.
pub fn setup_sentry() -> Option<ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|d| !d.is_empty())?;

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: std::env::var("APP_ENV").ok().map(Into::into),
            traces_sample_rate: 0.1,
            ..Default::default()
        },
    ));

    Some(guard)
}

/// `RUST_LOG` filter (default `info,<crate>=debug`) rendered as an indented tree
pub fn setup_tracing(crate_name: &str) -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("info,{crate_name}=debug")))?;

    let tree = HierarchicalLayer::default()
        .with_writer(std::io::stdout)
        .with_indent_lines(true)
        .with_indent_amount(2)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_verbose_exit(true)
        .with_verbose_entry(true)
        .with_targets(true);

    tracing_subscriber::registry()
        .with(tree)
        .with(filter)
        .try_init()?;

    Ok(())
}
