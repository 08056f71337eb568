// easel-common: shared wire and domain types for the easel workspace

pub mod protocol;
pub mod types;
