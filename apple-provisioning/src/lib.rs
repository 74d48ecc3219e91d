// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing asset resolution for Apple platforms.
//!
//! This crate decides which signing certificate and which provisioning
//! profile each target of an application should be signed with, and creates
//! missing assets through Apple's developer portal.
//!
//! The pieces, from the bottom up:
//!
//! * [AssetInventory] holds the certificates and provisioning profiles known
//!   locally (see [LocalAssetSource]) or remotely (see [RemoteAssetSource]).
//! * [CompatibilityMatcher] decides whether a profile can sign a target given
//!   its bundle identifier, entitlements, devices and a validity window.
//! * [GroupResolver] assigns a profile to every target, per certificate, through
//!   a series of tie-breaking tiers. See the [resolver] module documentation.
//! * [StrategySelector] decides whether Xcode or this crate manages signing.
//! * [ReconciliationEngine] ties the above together: it resolves locally,
//!   consults the developer portal when that fails, creates what is missing and
//!   persists the result through an [AssetWriter].
//!
//! The developer portal is reached through [developer_portal::DeveloperPortalClient],
//! which authenticates with either an App Store Connect API key or a saved
//! Apple ID session.
//!
//! This crate does not sign anything itself. Tools like `rcodesign` or
//! `codesign` consume the assets it selects.

mod asset_writer;
pub use asset_writer::*;
mod certificate;
pub use certificate::*;
mod config;
pub use config::*;
pub mod developer_portal;
mod distribution;
pub use distribution::*;
pub mod entitlements;
pub use entitlements::*;
mod error;
pub use error::*;
mod inventory;
pub use inventory::*;
mod matcher;
pub use matcher::*;
mod profile;
pub use profile::*;
mod project;
pub use project::*;
mod reconcile;
pub use reconcile::*;
mod remote;
pub use remote::*;
pub mod resolver;
pub use resolver::*;
mod strategy;
pub use strategy::*;
