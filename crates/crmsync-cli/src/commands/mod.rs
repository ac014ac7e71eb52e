pub mod common;
pub mod completions;
pub mod conflicts;
pub mod dead_letters;
pub mod list;
pub mod resolve;
pub mod retry;
pub mod run;
pub mod status;
