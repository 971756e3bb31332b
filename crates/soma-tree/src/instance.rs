// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Check instances and the hashes that identify them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::object::ObjectRef;
use crate::property::ServiceAttribute;

/// The service a check instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name.
    pub name: String,
    /// Attributes in canonical order.
    pub attributes: Vec<ServiceAttribute>,
}

impl ServiceConfig {
    /// Build a service config with canonically ordered attributes.
    pub fn new(name: impl Into<String>, mut attributes: Vec<ServiceAttribute>) -> Self {
        attributes.sort();
        attributes.dedup();
        Self {
            name: name.into(),
            attributes,
        }
    }

    /// Canonical JSON: object keys sorted, attributes in canonical order.
    pub fn to_canonical_json(&self) -> String {
        serde_json::json!({
            "name": self.name,
            "attributes": self
                .attributes
                .iter()
                .map(|a| serde_json::json!({ "name": a.name, "value": a.value }))
                .collect::<Vec<_>>(),
        })
        .to_string()
    }

    /// SHA-256 over the canonical JSON.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_json().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A concrete, versioned monitoring unit of one check on one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInstance {
    /// Instance id, derived from the element and the constraint hash.
    pub instance_id: Uuid,
    /// Check the instance was computed from.
    pub check_id: Uuid,
    /// Check configuration id.
    pub config_id: Uuid,
    /// Element the instance runs against.
    pub object: ObjectRef,
    /// Monotone version, bumped whenever the resolved values change.
    pub version: u32,
    /// Hash over the check lineage, constraints and selected service combination.
    pub constraint_hash: String,
    /// Hash over the property values the constraints resolved to.
    pub constraint_val_hash: String,
    /// Selected service, if the check is service bound.
    pub service: Option<ServiceConfig>,
    /// Hash of the selected service config; empty when there is none.
    pub service_cfg_hash: String,
}

impl CheckInstance {
    /// Name of the selected service.
    pub fn instance_service(&self) -> Option<&str> {
        self.service.as_ref().map(|s| s.name.as_str())
    }

    /// Serialized service config as stored alongside the instance.
    pub fn service_cfg_json(&self) -> Option<String> {
        self.service.as_ref().map(ServiceConfig::to_canonical_json)
    }

    /// Whether `other` carries different resolved values than `self`.
    pub fn values_differ(&self, other: &CheckInstance) -> bool {
        self.constraint_val_hash != other.constraint_val_hash
            || self.service_cfg_hash != other.service_cfg_hash
    }
}

/// Length-prefixed SHA-256 accumulator, so field boundaries cannot be confused.
#[derive(Clone)]
pub(crate) struct FieldHasher(Sha256);

impl FieldHasher {
    pub(crate) fn new(domain: &str) -> Self {
        let mut hasher = FieldHasher(Sha256::new());
        hasher.field(domain);
        hasher
    }

    pub(crate) fn field(&mut self, value: &str) -> &mut Self {
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    pub(crate) fn finish(self) -> String {
        format!("{:x}", self.0.finalize())
    }
}
