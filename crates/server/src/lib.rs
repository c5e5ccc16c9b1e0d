pub mod error;
pub mod middleware;
pub mod procedures;
pub mod routes;
