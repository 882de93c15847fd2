//! Online replacement of an EBS data volume on the running EC2 instance.
//!
//! The source volume is snapshotted, a replacement of the requested size is
//! created from the same settings, attached, formatted and filled with
//! `rsync`, then mounted in place of the original. The original is detached
//! and tagged `RecoverMe=Yes` rather than deleted.

pub mod cloud;
pub mod config;
pub mod error;
pub mod host;
pub mod imds;
pub mod inspect;
pub mod migrate;
pub mod preflight;
pub mod provision;
pub mod recoverable;
pub mod swap;
pub mod tags;
pub mod transfer;
pub mod wait;

pub use config::{Config, DeviceMigration};
pub use error::{MigrationError, SkipReason, Step};
pub use migrate::{DeviceOutcome, Migrator, RunReport};
