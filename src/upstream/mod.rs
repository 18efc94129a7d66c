//! Upstream registry access: auth challenge discovery, token handling, and
//! the remote repository client used by the proxy stores.

pub mod auth;
pub mod client;

pub use auth::{ChallengeManager, CredentialStore, RemoteAuthChallenger, TokenSource};
pub use client::{ByteStream, HttpRemoteRepository, RemoteRepository};
