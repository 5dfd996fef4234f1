//! Post-processing that repairs common OCR artifacts.
//!
//! Everything here is pure: no I/O, no quota, no clock. It's safe to run the
//! same input through twice.

pub mod invoice;
pub mod plate;
