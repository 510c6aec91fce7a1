use crate::config::Verbosity;

/// Installs an `env_logger` backend for the `log` facade. `RUST_LOG` takes precedence over
/// `verbosity`. Calling this more than once is harmless.
pub fn init(verbosity: Verbosity) {
    let default_filter = verbosity.level_filter().to_string();
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .is_test(cfg!(test))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init(Verbosity::Debug);
        init(Verbosity::Errors);
        log::debug!("Logging: initialized");
    }
}
