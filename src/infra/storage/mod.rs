pub mod file;

pub use file::{is_external_url, FileStorage};
