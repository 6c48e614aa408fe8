pub mod affinity;
pub mod feature_extractor;
pub mod label_projector;
pub mod label_utils;
pub mod neighborhood;

pub mod interpolation;
