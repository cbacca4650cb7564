pub mod breaker;
pub mod http;
