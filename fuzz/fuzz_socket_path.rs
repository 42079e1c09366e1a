//! Fuzz target for socket path resolution with arbitrary `VIGIL_SOCKET_PATH`
//! values.
//!
//! Run with: cargo +nightly fuzz run fuzz_socket_path

#![no_main]

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let env = OsString::from_vec(data.to_vec());
    let resolved = vigil_config::HelperConfig::default().resolve_socket_path(Some(env));
    assert!(vigil_config::fits_sun_path(&resolved.path));
});
