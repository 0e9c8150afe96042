pub mod capture_backend;
pub mod format_converter;
pub mod session_delegate;
