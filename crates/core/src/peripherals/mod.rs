pub mod gpio;
pub mod timer;
