use std::env;

fn main() {
    // Set build date
    let date = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    println!("cargo:rustc-env=BUILD_DATE={}", date);

    println!("cargo:rerun-if-env-changed=DNSQUIC_PICOQUIC_LIB_DIR");

    // The engine is built out of tree; only link it when the FFI backend is enabled
    if env::var_os("CARGO_FEATURE_PICOQUIC").is_none() {
        return;
    }

    match env::var("DNSQUIC_PICOQUIC_LIB_DIR") {
        Ok(dir) => println!("cargo:rustc-link-search=native={}", dir),
        Err(_) => println!(
            "cargo:warning=DNSQUIC_PICOQUIC_LIB_DIR is not set; relying on the default linker search path"
        ),
    }

    for lib in ["slipstream", "picoquic-core", "picotls-core", "picotls-openssl", "picotls-minicrypto"] {
        println!("cargo:rustc-link-lib=static={}", lib);
    }
    println!("cargo:rustc-link-lib=dylib=ssl");
    println!("cargo:rustc-link-lib=dylib=crypto");
}
