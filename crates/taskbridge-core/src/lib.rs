//! Core domain types and gateways for the taskbridge synchronizer.
//!
//! This crate holds everything that does not touch the durable store: the
//! task/member/mapping model with its status lattice, the pure field mapper
//! shared by both sync directions, environment-driven configuration, secret
//! redaction for gateway logs, and the typed facades over the two external
//! services (the forge issue tracker and the sheet database).

pub mod config;
pub mod forge;
pub mod gateway;
pub mod mapper;
pub mod model;
pub mod redact;
pub mod sheet;
