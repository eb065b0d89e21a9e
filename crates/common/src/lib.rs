pub mod db;
pub mod observability;
pub mod types;
