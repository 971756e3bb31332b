// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! soma-tree - the in-memory repository tree of soma.
//!
//! A [`Tree`] holds one repository's structure (repository, buckets, groups,
//! clusters and nodes), the properties and check configurations attached to
//! it, and the check instances computed from them. Every mutation is pure
//! in-memory work that reports what it did as a stream of [`Action`] values
//! and what went wrong as a stream of [`TreeError`] values; the owner drains
//! both after each job and mirrors the actions into its store.
//!
//! ```
//! use soma_tree::{ElementDetail, NewElement, ObjectKind, ObjectRef, Tree};
//! use uuid::Uuid;
//!
//! let mut tree = Tree::new();
//! tree.clear_load_info();
//! let repo = Uuid::new_v4();
//! tree.attach(
//!     NewElement {
//!         id: repo,
//!         name: "alpha".to_string(),
//!         team_id: Uuid::new_v4(),
//!         detail: ElementDetail::Repository { active: true },
//!     },
//!     ObjectRef::new(ObjectKind::Root, Tree::ROOT_ID),
//! );
//! assert_eq!(tree.drain_actions().first().map(|a| a.kind()), Some("create"));
//! assert!(tree.drain_errors().is_empty());
//! ```

#![deny(missing_docs)]

/// Actions emitted by tree mutations
pub mod action;
/// Check configurations materialized on elements
pub mod check;
/// Tree error stream entries
pub mod error;
/// Check instances and their hashes
pub mod instance;
/// Element kinds and element data
pub mod object;
/// Properties and their inheritance rules
pub mod property;
/// The arena tree
pub mod tree;

pub use action::{Action, DEFAULT_ACTION_CAP};
pub use check::{ATTRIBUTE_DEFINED, Check, CheckSpec, Constraint};
pub use error::TreeError;
pub use instance::{CheckInstance, ServiceConfig};
pub use object::{ElementDetail, ElementSnapshot, NewElement, ObjectKind, ObjectRef, ObjectState};
pub use property::{
    Property, PropertySpec, PropertyValue, ServiceAttribute, VIEW_ANY, VIEW_LOCAL,
};
pub use tree::{Element, Tree};
