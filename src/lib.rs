pub mod changeset;
pub mod commands;
pub mod config;
pub mod filter;
pub mod oc;
pub mod options;
pub mod patch;
pub mod resource;
pub mod secrets;
pub mod template;
pub mod test_utils;
