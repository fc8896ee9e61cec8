// Pixel-level building blocks of the overlay engine, leaf-first.

pub mod pixel;
pub mod contour;
pub mod raster;
pub mod codec;
pub mod query;
pub mod fov_detector;
pub mod candidate_builder;
pub mod instance_separator;
pub mod contour_filter;
pub mod scorer;
pub mod proposal;
pub mod selection;
pub mod mask_cache;
pub mod compositor;
pub mod recalibration;
