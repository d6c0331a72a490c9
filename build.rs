// build.rs

fn main() {
    // The libevdi link is only needed when the real device subsystem is
    // compiled in; the default build drives the simulated display.
    if std::env::var_os("CARGO_FEATURE_EVDI").is_none() {
        return;
    }

    // Try pkg-config first, which is the standard way to find library
    // linking information on Unix-like systems. If it fails (not installed,
    // or no .pc file shipped with libevdi), fall back to manual flags and
    // assume the library sits in a standard search path.
    if pkg_config::probe_library("evdi").is_err() {
        eprintln!("pkg-config failed for library 'evdi'. Falling back to manual linking.");
        println!("cargo:rustc-link-lib=evdi");
        println!("cargo:rustc-link-search=/usr/lib");
        println!("cargo:rustc-link-search=/usr/local/lib");
        eprintln!("Manual linking flags applied. Ensure the libevdi development files are installed.");
    }
}
