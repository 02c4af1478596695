//! Mobile bindings for the mailsync engine
//!
//! Library-mode UniFFI crate: builds the static/dynamic library that the
//! iOS and Android hosts link, and exposes the scaffolding generated in
//! `mailsync` so `uniffi-bindgen` can find every exported type.
//!
//! ## iOS
//!
//! ```bash
//! cargo build --release -p mailsync-ffi --target aarch64-apple-ios
//! cargo run -p mailsync-ffi --features bindgen --bin uniffi-bindgen generate \
//!     --library target/aarch64-apple-ios/release/libmailsync_ffi.a \
//!     --language swift \
//!     --out-dir generated/swift
//! ```
//!
//! ## Android
//!
//! ```bash
//! cargo build --release -p mailsync-ffi --target aarch64-linux-android
//! cargo run -p mailsync-ffi --features bindgen --bin uniffi-bindgen generate \
//!     --library target/aarch64-linux-android/release/libmailsync_ffi.so \
//!     --language kotlin \
//!     --out-dir generated/kotlin
//! ```

pub use mailsync::ffi::*;

mailsync::uniffi_reexport_scaffolding!();
