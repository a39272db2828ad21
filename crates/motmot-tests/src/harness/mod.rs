pub mod client;
pub mod domain;
pub mod peer;

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("motmot=debug,motmot_server=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
