// [[ASSEMBLY]]/libs/assembly-core/src/telemetry.rs
// Purpose: tracing bootstrap shared by both binaries.
// Dependencies: tracing-subscriber

use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `RUST_LOG` wins; `directives` are
/// appended as defaults (e.g. `assembly_orchestrator=debug`).
pub fn init_tracing(directives: &[&str]) {
    let mut filter = EnvFilter::from_default_env();
    for directive in directives {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("ignoring invalid log directive '{}': {}", directive, e),
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
