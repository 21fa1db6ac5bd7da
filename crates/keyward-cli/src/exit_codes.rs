//! Process exit codes. Part of the public contract for scripts wrapping the CLI.

pub const SUCCESS: i32 = 0;
pub const CONFIG_ERROR: i32 = 1; // Missing or malformed configuration/keys
pub const FAILURE: i32 = 2; // Translation, enablement or submission failed
pub const SECURITY_VIOLATION: i32 = 3; // Pin mismatch, blocked destination, unenabled session
