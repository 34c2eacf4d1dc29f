use log::SetLoggerError;

/// The environment variable that configures the built-in logger.  `RUST_LOG` is used if it is
/// not set.
pub const LOG_FILTER_ENV: &str = "MIRT_LOG";

/// Attempt to init a env_logger for mirt.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let filter_env = if std::env::var_os(LOG_FILTER_ENV).is_some() {
                LOG_FILTER_ENV
            } else {
                env_logger::DEFAULT_FILTER_ENV
            };
            env_logger::try_init_from_env(
                // By default, use info level logging.
                env_logger::Env::default().filter_or(filter_env, "info"),
            )
        } else {
            Ok(())
        }
    }
}
