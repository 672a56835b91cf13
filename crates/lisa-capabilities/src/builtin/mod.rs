pub mod basic;
pub mod files;
