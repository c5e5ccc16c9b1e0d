pub mod cookie;
pub mod password;
pub mod response;
pub mod sentry;
