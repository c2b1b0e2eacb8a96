//! Logger installation for plugins.
//!
//! STDOUT belongs to the reply, so nothing is ever logged there. Warnings and
//! errors go to STDERR, where runtimes usually capture them. Everything from
//! `debug` up also goes to a log file in development builds, and in release
//! builds with the **release-logs** feature.

use std::{
	env,
	fs::{self, File, OpenOptions},
	path::{Path, PathBuf},
};

use simplelog::{
	ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
	TerminalMode, WriteLogger,
};

/// Directory used for log files in release builds.
pub const RELEASE_LOG_DIR: &str = "/var/log/cni";

/// Baseline config: thread and target names only from `info` up.
///
/// Plugins typically add target filters before passing it to [`with_config`].
pub fn default_config() -> ConfigBuilder {
	let mut config = ConfigBuilder::new();
	config.set_thread_level(LevelFilter::Info);
	config.set_target_level(LevelFilter::Info);
	config
}

/// Install the logger with [`default_config`].
pub fn install(logname: impl AsRef<Path>) {
	with_config(logname, default_config().build())
}

/// Install the logger with a custom config.
///
/// If the log file can't be opened, logging continues on STDERR only and a
/// warning says why. If a logger is already installed this does nothing.
pub fn with_config(logname: impl AsRef<Path>, config: Config) {
	let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
		LevelFilter::Warn,
		config.clone(),
		TerminalMode::Stderr,
		ColorChoice::Never,
	)];

	let mut file_error = None;
	if cfg!(any(debug_assertions, feature = "release-logs")) {
		match open_logfile(logname.as_ref()) {
			Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, config, file)),
			Err(err) => file_error = Some(err),
		}
	}

	if CombinedLogger::init(loggers).is_err() {
		return;
	}

	if let Some(err) = file_error {
		log::warn!("logging to stderr only: {}", err);
	}
}

fn log_dir() -> std::io::Result<PathBuf> {
	if cfg!(debug_assertions) {
		env::current_dir()
	} else {
		Ok(PathBuf::from(RELEASE_LOG_DIR))
	}
}

fn open_logfile(logname: &Path) -> std::io::Result<File> {
	let mut logfile = log_dir()?.join(logname);
	logfile.set_extension("log");

	if let Some(dir) = logfile.parent() {
		fs::create_dir_all(dir)?;
	}

	OpenOptions::new().append(true).create(true).open(logfile)
}
