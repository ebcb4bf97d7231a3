pub mod console;
pub mod daemon;
