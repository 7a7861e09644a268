//! Integration test support crate. The scenarios live in tests/.
