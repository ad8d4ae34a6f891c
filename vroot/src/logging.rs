//! Diagnostic output setup.

use tracing::Level;

/// Installs a stderr subscriber: DEBUG when `debug` is set, WARN otherwise.
///
/// Does nothing if a global subscriber is already installed.
pub fn init(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::WARN };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init(true);
        super::init(false);
        tracing::debug!("still alive");
    }
}
