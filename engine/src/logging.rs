//! Tracing setup shared by the pipeline binaries.

/// Install the global subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() -> anyhow::Result<()> {
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.try_init()
		.map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))
}
