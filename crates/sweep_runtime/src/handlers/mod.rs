pub mod driver;
pub mod manifest;
pub mod recorder;
pub mod stages;
