#![doc = "hr-doc-sync-core: synchronisation engine for hr-doc-sync."]

//! This crate holds the vendor-neutral engine that copies HR documents from a paged
//! source-of-record into a document-management store, exactly once per document.
//! Vendor HTTP clients live in the CLI crate and plug in through [`contract`].
//!
//! # Modules
//! - [`contract`]: collaborator traits and the records passed between them
//! - [`classify`], [`routing`]: immutable lookup tables
//! - [`ledger`]: SQLite and in-memory ledgers
//! - [`fetch`], [`worker`], [`dispatch`]: the pipeline
//! - [`synchronise`]: run controller
//! - [`report`], [`pages`]: exception report and page-count tooling

pub mod classify;
pub mod contract;
pub mod dispatch;
pub mod fetch;
pub mod ledger;
pub mod pages;
pub mod report;
pub mod routing;
pub mod synchronise;
pub mod worker;
