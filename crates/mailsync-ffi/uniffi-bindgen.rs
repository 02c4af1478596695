//! Binding generator entry point for the mailsync library.
//!
//!   cargo run -p mailsync-ffi --features bindgen --bin uniffi-bindgen generate \
//!       --library <path to libmailsync_ffi> --language <swift|kotlin> --out-dir <dir>

fn main() {
    uniffi::uniffi_bindgen_main()
}
