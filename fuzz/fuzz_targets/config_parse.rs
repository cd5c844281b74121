#![no_main]

use libfuzzer_sys::fuzz_target;
use mezclar::config::{build_dispatcher, from_yaml_str};

/// Fuzz target for configuration parsing
///
/// Arbitrary YAML must either be rejected with an error or build a
/// dispatcher; it must never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(yaml) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(spec) = from_yaml_str(yaml) else {
        return;
    };

    // Invariant: a spec that validates also builds
    let dispatcher = build_dispatcher(&spec);
    assert!(dispatcher.is_ok(), "validated spec failed to build: {dispatcher:?}");
});
