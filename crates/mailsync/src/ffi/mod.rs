//! FFI bindings for UniFFI export
//!
//! Swift/Kotlin surface of the engine.
//!
//! ## Usage from Swift
//!
//! ```swift
//! import MailsyncFFI
//!
//! initializeLogging(callback: logger, maxLevel: .info)
//!
//! let service = try MailService(
//!     dbPath: dir + "/mail.db",
//!     blobPath: dir + "/bodies",
//!     attachmentPath: dir + "/outbox",
//!     clientId: clientId,
//!     clientSecret: nil,
//!     device: deviceMonitor,
//!     scheduler: taskScheduler,
//!     credentials: keychain,
//!     notifier: notificationCenter
//! )
//!
//! let token = createTokenJson(accessToken: access, refreshToken: refresh, expiresAt: expiry)
//! try service.registerAccount(accountId: 1, email: email, displayName: nil, tokenJson: token)
//! try service.scheduleBackgroundTasks()
//!
//! // In a BGTask launch handler
//! task.expirationHandler = { _ = try? service.expireBackgroundTask(identifier: task.identifier) }
//! try service.runBackgroundTask(identifier: task.identifier)
//! ```

mod logging;
mod service;
mod types;

pub use logging::{init_ffi_logger, set_log_callback, set_log_level};
pub use service::*;
pub use types::*;
