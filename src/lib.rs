//! keyward - local, single-user secrets manager.
//!
//! This crate provides the trust and storage kernel for a local secrets
//! manager: a password-derived encrypted [`vault`] of projects and secrets,
//! an encrypted append-only [`logger`], an offline [`license`] check, and a
//! bearer-authenticated loopback [`server`] that brokers access through an
//! [`approval`] callback.
//!
//! # Architecture
//!
//! ```text
//! CLI binary (main.rs) ── or an external client over the loopback server
//!     │
//!     ▼
//! lifecycle::Kernel ───── ties the pieces together, owns the idle-lock timer
//!     │
//!     ├── vault::VaultStore ─── encrypted projects/secrets/history/favorites
//!     ├── logger::Logger ────── encrypted, capped, masked event log
//!     ├── license::LicenseVerifier
//!     └── server::AccessServer ─ bearer-authenticated JSON-over-HTTP
//! ```
//!
//! # Security
//!
//! - **Argon2id** key derivation (64 MiB memory, 3 iterations)
//! - **XChaCha20-Poly1305** authenticated encryption
//! - **zeroize** for clearing key material on lock
//! - **Idle auto-lock** (default 5 minutes)
//! - Constant-time bearer-token comparison on the loopback server

pub mod approval;
pub mod config;
pub mod crypto;
pub mod fsutil;
pub mod handshake;
pub mod license;
pub mod lifecycle;
pub mod logger;
pub mod models;
pub mod server;
pub mod vault;
