pub mod forecast;
pub mod loads;
pub mod plan;
pub mod plant;
