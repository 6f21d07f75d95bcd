pub mod episodes;
pub mod models;
