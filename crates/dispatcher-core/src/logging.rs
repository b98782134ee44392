//! Tracing subscriber setup.
//!
//! `DISPATCHER_CLIENT_DEBUG` and `DISPATCHER_TRANSPORT_DEBUG` raise the
//! respective targets to `debug`, on top of whatever `RUST_LOG` says.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber.  Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var_os("DISPATCHER_CLIENT_DEBUG").is_some() {
        filter = filter.add_directive(
            "dispatcher_core=debug"
                .parse()
                .expect("static directive parses"),
        );
    }
    if std::env::var_os("DISPATCHER_TRANSPORT_DEBUG").is_some() {
        filter = filter.add_directive(
            "dispatcher_transport=debug"
                .parse()
                .expect("static directive parses"),
        );
    }
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
