//! User-facing page error strings. A UI layer would localize these keys;
//! the engine only guarantees which one is attached to a failed page.

pub const ERROR_UNKNOWN: &str = "Unknown error";
pub const ERROR_INVALID_URL: &str = "Invalid image URL";
pub const ERROR_SOCKET: &str = "Network error";
pub const ERROR_PARSE: &str = "Failed to parse page";
pub const ERROR_509: &str = "Rate limited (509)";
pub const ERROR_WRITE_FAILED: &str = "Failed to write image";
pub const ERROR_PTOKEN_FAILED: &str = "Failed to get pToken";

pub const ERROR_OUT_OF_RANGE: &str = "Page out of range";
pub const ERROR_NOT_FOUND: &str = "Image not found";
pub const ERROR_READ_FAILED: &str = "Failed to read image";
pub const ERROR_DECODE_FAILED: &str = "Failed to decode image";
