#![doc = "dvtoolbox-core: reconciliation, job tracking and registration logic for dvtoolbox."]

//! Everything here talks to the platform through [`contract::RemoteClient`];
//! the networked client and the command line live in the `dvtoolbox` crate.
//!
//! # Layout
//! - [`reconcile`]: diff a local artifact view against a remote one and apply the plan.
//! - [`tracker`]: start and poll server-side async jobs.
//! - [`registration`]: register extension modules described by [`descriptor`].
//! - [`diagram`]: Mermaid flowcharts of cloud flows.
//! - [`webresource`], [`flows`], [`solution_items`], [`solution`]: the per-kind sources, sinks and jobs.

pub mod artifact;
pub mod config;
pub mod contract;
pub mod descriptor;
pub mod diagram;
pub mod document;
pub mod error;
pub mod flows;
pub mod lookup;
pub mod package;
pub mod progress;
pub mod reconcile;
pub mod registration;
pub mod solution;
pub mod solution_items;
pub mod tracker;
pub mod webresource;

#[cfg(any(test, feature = "test-export-mocks"))]
pub mod testing;

pub use error::{RemoteError, Result, ToolboxError};
