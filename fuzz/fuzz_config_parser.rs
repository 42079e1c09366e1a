//! Fuzz target for the helper's TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = vigil_config::HelperConfig::parse(s) {
            // Anything that validates must resolve to a bindable path.
            let resolved = config.resolve_socket_path(None);
            assert!(vigil_config::fits_sun_path(&resolved.path));
        }
    }
});
