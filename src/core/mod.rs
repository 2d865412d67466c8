pub mod confluence;
pub mod recovery;
pub mod risk;
pub mod stops;
pub mod sweeps;
pub mod swings;
