use std::env;

const INSTALL_DIR: &str = "/opt/xxnetwork/lib";

fn main() {
    if let Ok(val) = env::var("DOCS_RS") {
        if val.parse::<u32>() == Ok(1) {
            return;
        }
    }

    println!("Build gpumaths-cuda-backend");
    println!("cargo:rerun-if-env-changed=POWMOSM75_LIB_DIR");
    if env::consts::OS != "linux" {
        panic!(
            "Error: platform not supported, gpumaths-cuda-backend not built (only Linux is supported)"
        );
    }

    // Explicit override first, then pkg-config, then the default install location
    if let Ok(dir) = env::var("POWMOSM75_LIB_DIR") {
        link_from(&dir);
    } else if pkg_config::Config::new()
        .atleast_version("0.1")
        .probe("powmosm75")
        .is_ok()
    {
        // pkg-config already emitted the link flags
    } else {
        println!(
            "cargo:warning=powmosm75 not found through pkg-config, falling back to {INSTALL_DIR}"
        );
        link_from(INSTALL_DIR);
    }

    println!("cargo:rustc-link-search=native=/usr/local/cuda/lib64");
    println!("cargo:rustc-link-lib=cudart");
    println!("cargo:rustc-link-lib=stdc++");
}

fn link_from(dir: &str) {
    // The development build in ./lib takes priority over the installed one when both exist
    if cfg!(feature = "dev-lib") {
        println!("cargo:rustc-link-search=native=./lib");
        println!("cargo:rustc-link-arg=-Wl,-rpath,./lib");
    }
    println!("cargo:rustc-link-search=native={dir}");
    println!("cargo:rustc-link-arg=-Wl,-rpath,{dir}");
    println!("cargo:rustc-link-lib=dylib=powmosm75");
}
