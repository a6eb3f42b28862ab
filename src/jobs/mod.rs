pub mod compress;
pub mod probe;
