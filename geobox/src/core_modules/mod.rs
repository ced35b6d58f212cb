pub mod contour;
pub mod fluid;
pub mod frame;
pub mod grid;
pub mod normalizer;
pub mod terrain_match;
pub mod utils;
pub mod warper;
