use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Stamp the binary with its build time as seconds since the epoch; the
    // gateway renders it human-readable at startup.
    let build_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=BUILD_EPOCH={}", build_epoch);
}
