#![forbid(unsafe_code)]

pub mod access;
pub mod access_token;
pub mod audit;
pub mod auth;
pub mod codec;
pub mod connection;
pub mod error;
pub mod health;
pub mod http_api;
pub mod hub;
pub mod password;
pub mod presence;
pub mod rate_limiter;
pub mod revocation;
pub mod store;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod access_tests;


#[cfg(test)]
mod hub_tests;
