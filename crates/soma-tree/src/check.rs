// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checks: check configurations materialized on tree elements.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::object::ObjectKind;
use crate::property::derive_id;

/// Attribute constraint value that matches every value of the attribute.
pub const ATTRIBUTE_DEFINED: &str = "@defined";

/// A constraint a check configuration places on the elements it is instantiated on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// Element attribute: `object_type`, `object_state` or `environment`.
    Native {
        /// Attribute name.
        name: String,
        /// Required value.
        value: String,
    },
    /// System property with the given value.
    System {
        /// Property key.
        name: String,
        /// Required value.
        value: String,
    },
    /// Custom property with the given value.
    Custom {
        /// Custom property definition id.
        custom_id: Uuid,
        /// Custom property name.
        name: String,
        /// Required value.
        value: String,
    },
    /// Oncall duty assignment.
    Oncall {
        /// Oncall duty id.
        oncall_id: Uuid,
        /// Oncall duty name.
        name: String,
    },
    /// Service property by name.
    Service {
        /// Service name.
        name: String,
    },
    /// Service attribute; `@defined` expands to every value present.
    Attribute {
        /// Attribute name.
        name: String,
        /// Required value or `@defined`.
        value: String,
    },
}

impl Constraint {
    /// Constraint type as stored in the database.
    pub fn type_str(&self) -> &'static str {
        match self {
            Constraint::Native { .. } => "native",
            Constraint::System { .. } => "system",
            Constraint::Custom { .. } => "custom",
            Constraint::Oncall { .. } => "oncall",
            Constraint::Service { .. } => "service",
            Constraint::Attribute { .. } => "attribute",
        }
    }

    /// Canonical text form used for hashing.
    pub fn canonical(&self) -> String {
        match self {
            Constraint::Native { name, value } => format!("native:{}={}", name, value),
            Constraint::System { name, value } => format!("system:{}={}", name, value),
            Constraint::Custom {
                custom_id, value, ..
            } => format!("custom:{}={}", custom_id, value),
            Constraint::Oncall { oncall_id, .. } => format!("oncall:{}", oncall_id),
            Constraint::Service { name } => format!("service:{}", name),
            Constraint::Attribute { name, value } => format!("attribute:{}={}", name, value),
        }
    }

    /// Whether the constraint selects services rather than filtering the element.
    pub fn is_service_bound(&self) -> bool {
        matches!(self, Constraint::Service { .. } | Constraint::Attribute { .. })
    }
}

/// Request to place a check configuration on an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Check configuration id.
    pub config_id: Uuid,
    /// Check configuration name.
    pub name: String,
    /// Capability the configuration monitors.
    pub capability_id: Uuid,
    /// View of the capability; scopes which properties constraints see.
    pub view: String,
    /// Whether descendants receive the check.
    pub inheritance: bool,
    /// Whether the check applies to descendants only.
    pub children_only: bool,
    /// Constraints, in any order.
    pub constraints: Vec<Constraint>,
}

/// A check configuration materialized on one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    /// Check id on this element.
    pub check_id: Uuid,
    /// Check id on the element the configuration was placed on.
    pub source_check_id: Uuid,
    /// Element holding the source check; `None` for the source itself.
    pub inherited_from: Option<Uuid>,
    /// Kind of the element holding the source check.
    pub source_kind: ObjectKind,
    /// Check configuration id.
    pub config_id: Uuid,
    /// Check configuration name.
    pub name: String,
    /// Capability id.
    pub capability_id: Uuid,
    /// Capability view.
    pub view: String,
    /// Inheritance flag.
    pub inheritance: bool,
    /// Children-only flag.
    pub children_only: bool,
    /// Constraints in canonical order.
    pub constraints: Vec<Constraint>,
}

impl Check {
    /// Build the source check for `spec` placed on `object_id`.
    pub fn source(spec: &CheckSpec, object_id: Uuid, object_kind: ObjectKind) -> Check {
        let mut constraints = spec.constraints.clone();
        constraints.sort();
        constraints.dedup();
        Check {
            check_id: Self::source_id(spec.config_id, object_id),
            source_check_id: Self::source_id(spec.config_id, object_id),
            inherited_from: None,
            source_kind: object_kind,
            config_id: spec.config_id,
            name: spec.name.clone(),
            capability_id: spec.capability_id,
            view: spec.view.clone(),
            inheritance: spec.inheritance,
            children_only: spec.children_only,
            constraints,
        }
    }

    /// Id of the source check of a configuration placed on an element.
    pub fn source_id(config_id: Uuid, object_id: Uuid) -> Uuid {
        derive_id(config_id, object_id)
    }

    /// Whether this is the source check.
    pub fn is_source(&self) -> bool {
        self.inherited_from.is_none()
    }

    /// Element holding the source check, given the element holding this one.
    pub fn origin(&self, holder: Uuid) -> Uuid {
        self.inherited_from.unwrap_or(holder)
    }

    /// Whether instances are computed for this check on its element.
    pub fn is_effective(&self) -> bool {
        !(self.is_source() && self.children_only)
    }

    /// Build the inherited copy placed on `object_id`.
    pub(crate) fn inherited_copy(&self, object_id: Uuid, origin: Uuid) -> Check {
        Check {
            check_id: derive_id(self.source_check_id, object_id),
            source_check_id: self.source_check_id,
            inherited_from: Some(origin),
            source_kind: self.source_kind,
            config_id: self.config_id,
            name: self.name.clone(),
            capability_id: self.capability_id,
            view: self.view.clone(),
            inheritance: self.inheritance,
            children_only: false,
            constraints: self.constraints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_check_id_is_derived_from_config_and_object() {
        let spec = CheckSpec {
            config_id: Uuid::new_v4(),
            name: "load-high".to_string(),
            capability_id: Uuid::new_v4(),
            view: "internal".to_string(),
            inheritance: true,
            children_only: false,
            constraints: vec![],
        };
        let object = Uuid::new_v4();
        let a = Check::source(&spec, object, ObjectKind::Bucket);
        let b = Check::source(&spec, object, ObjectKind::Bucket);
        assert_eq!(a.check_id, b.check_id);
        assert_eq!(a.check_id, a.source_check_id);

        let copy = a.inherited_copy(Uuid::new_v4(), object);
        assert_eq!(copy.source_check_id, a.check_id);
        assert_ne!(copy.check_id, a.check_id);
        assert_eq!(copy.inherited_from, Some(object));
    }

    #[test]
    fn test_constraints_are_canonically_ordered() {
        let spec = CheckSpec {
            config_id: Uuid::new_v4(),
            name: "load-high".to_string(),
            capability_id: Uuid::new_v4(),
            view: "internal".to_string(),
            inheritance: false,
            children_only: false,
            constraints: vec![
                Constraint::Service {
                    name: "www".to_string(),
                },
                Constraint::Native {
                    name: "object_type".to_string(),
                    value: "node".to_string(),
                },
            ],
        };
        let check = Check::source(&spec, Uuid::new_v4(), ObjectKind::Node);
        assert_eq!(check.constraints[0].type_str(), "native");
        assert!(check.constraints[1].is_service_bound());
    }
}
