use crate::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "fix-dynamic-base.log";

/// Sets up stderr logging and, if enabled, a log file next to the executable.
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(config: &Config) -> Option<WorkerGuard> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.log_level))
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

	let appender = Config::log_dir()
		.filter(|_| config.log_to_file)
		.and_then(|dir| {
			RollingFileAppender::builder()
				.rotation(Rotation::NEVER)
				.filename_prefix(LOG_FILE_NAME)
				.build(dir)
				.map_err(|e| eprintln!("Couldn't open log file: {}", e))
				.ok()
		});

	let (file_layer, guard) = match appender {
		Some(appender) => {
			let (writer, guard) = tracing_appender::non_blocking(appender);
			let layer = fmt::layer()
				.with_writer(writer)
				.with_ansi(false)
				.boxed();
			(Some(layer), Some(guard))
		}
		None => (None, None),
	};

	if let Err(e) = tracing_subscriber::registry()
		.with(filter)
		.with(stderr_layer)
		.with(file_layer)
		.try_init()
	{
		eprintln!("Couldn't initialise logging: {}", e);
	}

	guard
}
