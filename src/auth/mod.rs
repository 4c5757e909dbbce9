mod digest;
pub mod middleware;

pub use digest::{ha1, hash_hex, DigestAuth, DEFAULT_REALM};
pub use middleware::auth_middleware;

#[cfg(test)]
pub(crate) use digest::tests::authorization;
