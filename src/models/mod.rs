pub mod sample;

pub use sample::{Coordinate, Sample};
