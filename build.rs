/// Build script for speech-bridge
///
/// Only the Vosk backend links a native library. When the `vosk` feature is
/// enabled on Linux, the binary gets an RPATH of $ORIGIN so it finds
/// libvosk.so next to itself, and `VOSK_LIB_PATH` or a `vosk-lib/` directory
/// in the project root is added to the library search path.

use std::env;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-env-changed=VOSK_LIB_PATH");

    if env::var_os("CARGO_FEATURE_VOSK").is_none() {
        return;
    }
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("linux") {
        return;
    }

    println!("cargo:rustc-link-arg=-Wl,-rpath,$ORIGIN");

    if let Ok(vosk_path) = env::var("VOSK_LIB_PATH") {
        println!("cargo:rustc-link-search=native={}", vosk_path);
    }

    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        let vosk_lib_dir = Path::new(&manifest_dir).join("vosk-lib");
        if vosk_lib_dir.exists() {
            println!("cargo:rustc-link-search=native={}", vosk_lib_dir.display());
        }
    }
}
