//! Logging and trace export for Recall binaries.

pub mod tracing_setup;
