//! div-core: the resource model shared by every div crate.
//!
//! A [`Resource`] is a named, labeled, kind-tagged record with an open
//! `spec` mapping. The typed views in [`spec`] decode that mapping at the
//! point of use, so a missing required field surfaces as one localized
//! [`CoreError::InvalidSpec`] instead of scattered lookups.

pub mod config;
pub mod error;
pub mod resource;
pub mod selector;
pub mod spec;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use resource::{CustomResourceDefinition, Kind, Metadata, Resource};
pub use selector::{Selector, SelectorOp};
pub use spec::*;
