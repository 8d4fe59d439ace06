pub mod builtin;
pub mod files;
pub mod registry;
pub mod sandbox;

pub use files::{write_direct_files, FileReport};
pub use registry::ToolRegistry;
pub use sandbox::ProcessSandbox;
