// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Vendor cookbooks into a shared shelf without ever leaving it half written.
//!
//! Virtual machine provisioners commonly share a directory of vendored
//! cookbooks, the __shelf__, with the guest. Some folder sharing methods break
//! when the shared directory is deleted and recreated, which is exactly what
//! a naive vendoring step does. Shelfsync vendors into a __staging__ directory
//! next to the shelf instead, then mirrors the staging directory into the
//! shelf so that only the changed files are touched.
//!
//! The heart of the crate is [`Publisher`], which implements that staged
//! build plus sync pattern for any populate callback. The [`action`] module
//! wraps it with the decision logic a provisioning pipeline needs, i.e.,
//! whether to vendor at all, and whether the host is new enough.

pub mod action;
pub mod config;
pub mod path;
pub mod publish;
mod syscall;
pub mod vendor;

pub use action::{Environment, InstallAction, Provisioner};
pub use config::ShelfConfig;
pub use publish::{
    derive_staging_path,
    mirror::{MirrorSync, NativeMirror, RsyncMirror},
    PublishError, PublishReport, Publisher, StalePolicy,
};
pub use vendor::{BerksVendor, Vendor};
