//! Bandhan — client messaging core for the Bandhan matrimony app.
//!
//! Keeps a locally rendered conversation consistent with a periodically
//! refreshed, eventually consistent backend: optimistic sends with
//! temp-id reconciliation, delivery-state tracking, typing coordination,
//! paginated history with scroll-anchor preservation, voice capture, and
//! subscription-tier send gating.

pub mod config;
pub mod controller;
pub mod delivery;
pub mod gate;
pub mod index;
pub mod services;
pub mod stream;
pub mod typing;
pub mod voice;
