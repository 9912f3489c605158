//! Architecture specific debug access.

pub mod arm;
