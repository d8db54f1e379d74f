//! plughost - plugin discovery, isolation and lifecycle management
//!
//! This library lets a host application load plugin modules from a directory,
//! keep each module in its own isolation boundary, and initialize the plugins
//! in dependency order.
//!
//! # Modules
//!
//! - [`config`]: Configuration management and serialization
//! - [`plugins`]: Plugin contract, loader, dependency resolver and lifecycle manager

pub mod config;
pub mod plugins;
