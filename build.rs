//! Embeds the sandboxed libheif module.
//!
//! The module is looked up at `$ZENHEIC_WASM`, then `wasm/heif.wasm.gz`
//! (produced by `wasm/build.sh`). When neither exists an empty placeholder is
//! embedded, a warning is printed, and the sandboxed backend reports itself
//! unavailable at runtime.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_MODULE: &str = "wasm/heif.wasm.gz";

fn main() {
    println!("cargo:rerun-if-env-changed=ZENHEIC_WASM");
    println!("cargo:rerun-if-changed={DEFAULT_MODULE}");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("cargo sets OUT_DIR"));
    let dest = out_dir.join("heif.wasm.gz");

    let source = env::var_os("ZENHEIC_WASM")
        .map(PathBuf::from)
        .or_else(|| {
            let default = Path::new(DEFAULT_MODULE);
            default.exists().then(|| default.to_path_buf())
        });

    match source {
        Some(path) => {
            println!("cargo:rerun-if-changed={}", path.display());
            fs::copy(&path, &dest).unwrap_or_else(|e| {
                panic!("failed to copy sandbox module {}: {e}", path.display())
            });
        }
        None => {
            println!(
                "cargo:warning=no sandbox module found (set ZENHEIC_WASM or run wasm/build.sh); \
                 the sandboxed backend will be unavailable"
            );
            fs::write(&dest, []).expect("failed to write empty sandbox module placeholder");
        }
    }
}
