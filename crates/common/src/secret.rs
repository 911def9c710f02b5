//! Secret wrappers for values that must never reach a log line.
//!
//! The worker holds two kinds of secrets: the HMAC key used to sign client
//! tokens and infrastructure URLs that may embed credentials (e.g.
//! `redis://:password@host`). Both are kept in [`SecretString`], whose `Debug`
//! output is redacted, so deriving `Debug` on a config struct stays safe.
//!
//! Reading the value requires an explicit `expose_secret()` call, which keeps
//! every use site greppable.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let secret = SecretString::from("0123456789abcdef0123456789abcdef");
//! assert!(!format!("{secret:?}").contains("0123"));
//! assert_eq!(secret.expose_secret().len(), 32);
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Text used by hand-written `Debug` impls in place of a secret field.
pub const REDACTED: &str = "[REDACTED]";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@cache:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("signing-key");
        assert_eq!(secret.expose_secret(), "signing-key");
    }
}
