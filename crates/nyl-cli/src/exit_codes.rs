//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

/// General error - unspecified failure
pub const ERROR: i32 = 1;

/// Validation error - parameter schema or deployment document rejected
pub const VALIDATION_ERROR: i32 = 2;

/// Template error - a template or resource failed to render
pub const TEMPLATE_ERROR: i32 = 3;

/// Package error - package missing, unreadable or cyclic
pub const PACKAGE_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// Usage error - invalid arguments or options (following sysexits.h convention)
pub const USAGE_ERROR: i32 = 64;
