pub mod chase;
pub mod products;
