//! Invitation conduit: a server-mediated rendezvous between an
//! authenticated "greeter" and an unauthenticated "claimer" holding a
//! one-time invitation token.

pub mod api;
pub mod conduit;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod invitation;
pub mod presence;
pub mod server;
