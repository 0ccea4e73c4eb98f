//! Symmetric encryption for the proxvoice media channel.
//!
//! This crate provides:
//! - A cipher abstraction selected by a Java-style algorithm identifier
//!   (`AES/CBC/PKCS5Padding` by default, `AES/GCM/NoPadding` optionally)
//! - The server-wide key and per-session key derivation

pub mod cipher;
pub mod keys;

pub use cipher::{create, Encryption, EncryptionError, AES_CBC, AES_GCM, DEFAULT_ALGORITHM, KEY_LEN};
pub use keys::{ServerKey, SessionKey};
