// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Properties attached to tree elements.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// View that never inherits.
pub const VIEW_LOCAL: &str = "local";

/// View that matches every capability view.
pub const VIEW_ANY: &str = "any";

/// One attribute of a service property. Attributes may repeat with different values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceAttribute {
    /// Attribute name, e.g. `port` or `credential_user`.
    pub name: String,
    /// Attribute value.
    pub value: String,
}

impl ServiceAttribute {
    /// Create an attribute.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The typed payload of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyValue {
    /// Well-known key/value.
    System {
        /// Property key.
        name: String,
        /// Property value.
        value: String,
    },
    /// Repository-scoped user-defined key/value.
    Custom {
        /// Custom property definition id.
        custom_id: Uuid,
        /// Custom property name.
        name: String,
        /// Property value.
        value: String,
    },
    /// Named team service with attributes.
    Service {
        /// Service name.
        name: String,
        /// Attributes in canonical order.
        attributes: Vec<ServiceAttribute>,
    },
    /// Oncall duty reference.
    Oncall {
        /// Oncall duty id.
        oncall_id: Uuid,
        /// Oncall duty name.
        name: String,
        /// Oncall phone number.
        number: String,
    },
}

impl PropertyValue {
    /// Property type as stored in the database.
    pub fn type_str(&self) -> &'static str {
        match self {
            PropertyValue::System { .. } => "system",
            PropertyValue::Custom { .. } => "custom",
            PropertyValue::Service { .. } => "service",
            PropertyValue::Oncall { .. } => "oncall",
        }
    }

    /// The key that must be unique per element and view for locally set properties.
    pub fn identity(&self) -> String {
        match self {
            PropertyValue::System { name, .. } => format!("system:{}", name),
            PropertyValue::Custom { custom_id, .. } => format!("custom:{}", custom_id),
            PropertyValue::Service { name, .. } => format!("service:{}", name),
            PropertyValue::Oncall { oncall_id, .. } => format!("oncall:{}", oncall_id),
        }
    }

    /// Canonical text form of identity and value, used for hashing.
    pub fn canonical(&self) -> String {
        match self {
            PropertyValue::System { name, value } => format!("system:{}={}", name, value),
            PropertyValue::Custom {
                custom_id, value, ..
            } => format!("custom:{}={}", custom_id, value),
            PropertyValue::Service { name, attributes } => {
                let mut out = format!("service:{}", name);
                for attribute in attributes {
                    out.push_str(&format!(";{}={}", attribute.name, attribute.value));
                }
                out
            }
            PropertyValue::Oncall {
                oncall_id, number, ..
            } => format!("oncall:{}={}", oncall_id, number),
        }
    }

    /// Put service attributes into canonical order.
    pub fn canonicalize(&mut self) {
        if let PropertyValue::Service { attributes, .. } = self {
            attributes.sort();
            attributes.dedup();
        }
    }
}

/// Request to attach a property to an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Instance id of the source attachment.
    pub source_instance_id: Uuid,
    /// Scope label.
    pub view: String,
    /// Whether descendants receive copies.
    pub inheritance: bool,
    /// Whether the property applies to descendants only.
    pub children_only: bool,
    /// The property payload.
    pub value: PropertyValue,
}

/// A property attached to one element, either locally or by inheritance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Stable instance id of this attachment.
    pub instance_id: Uuid,
    /// Instance id of the attachment that originated it.
    pub source_instance_id: Uuid,
    /// Element the source attachment lives on; `None` for local properties.
    pub inherited_from: Option<Uuid>,
    /// Scope label.
    pub view: String,
    /// Inheritance flag.
    pub inheritance: bool,
    /// Children-only flag.
    pub children_only: bool,
    /// The property payload.
    pub value: PropertyValue,
}

impl Property {
    /// Whether this is the source attachment.
    pub fn is_source(&self) -> bool {
        self.inherited_from.is_none()
    }

    /// Whether the property applies to the element holding it.
    ///
    /// Source attachments flagged children-only are stored on the element
    /// but only take effect on descendants.
    pub fn is_effective(&self) -> bool {
        !(self.is_source() && self.children_only)
    }

    /// Whether descendants receive copies of this attachment.
    pub fn inherits(&self) -> bool {
        self.inheritance && self.view != VIEW_LOCAL
    }

    /// Whether the property is visible to a check with the given capability view.
    pub fn matches_view(&self, view: &str) -> bool {
        self.view == view || self.view == VIEW_ANY
    }

    /// Build the inherited copy placed on `object_id`.
    pub(crate) fn inherited_copy(&self, object_id: Uuid, origin: Uuid) -> Property {
        Property {
            instance_id: derive_id(self.source_instance_id, object_id),
            source_instance_id: self.source_instance_id,
            inherited_from: Some(origin),
            view: self.view.clone(),
            inheritance: self.inheritance,
            children_only: false,
            value: self.value.clone(),
        }
    }
}

/// Derive a stable child identity from a source identity and an element id.
pub(crate) fn derive_id(source: Uuid, object_id: Uuid) -> Uuid {
    Uuid::new_v5(&source, object_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(name: &str, value: &str) -> PropertyValue {
        PropertyValue::System {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_children_only_source_is_not_effective() {
        let property = Property {
            instance_id: Uuid::new_v4(),
            source_instance_id: Uuid::new_v4(),
            inherited_from: None,
            view: "internal".to_string(),
            inheritance: true,
            children_only: true,
            value: system("retention_days", "30"),
        };
        assert!(!property.is_effective());

        let copy = property.inherited_copy(Uuid::new_v4(), Uuid::new_v4());
        assert!(copy.is_effective());
        assert_eq!(copy.source_instance_id, property.source_instance_id);
    }

    #[test]
    fn test_inherited_copy_ids_are_stable() {
        let source = Uuid::new_v4();
        let object = Uuid::new_v4();
        assert_eq!(derive_id(source, object), derive_id(source, object));
        assert_ne!(derive_id(source, object), derive_id(source, Uuid::new_v4()));
    }

    #[test]
    fn test_local_view_never_inherits() {
        let property = Property {
            instance_id: Uuid::new_v4(),
            source_instance_id: Uuid::new_v4(),
            inherited_from: None,
            view: VIEW_LOCAL.to_string(),
            inheritance: true,
            children_only: false,
            value: system("tag", "x"),
        };
        assert!(!property.inherits());
        assert!(!property.matches_view("internal"));
    }

    #[test]
    fn test_canonicalize_sorts_service_attributes() {
        let mut value = PropertyValue::Service {
            name: "www".to_string(),
            attributes: vec![
                ServiceAttribute::new("port", "443"),
                ServiceAttribute::new("port", "80"),
                ServiceAttribute::new("port", "443"),
                ServiceAttribute::new("proto", "tcp"),
            ],
        };
        value.canonicalize();
        let PropertyValue::Service { attributes, .. } = value else {
            panic!("expected service");
        };
        assert_eq!(
            attributes,
            vec![
                ServiceAttribute::new("port", "443"),
                ServiceAttribute::new("port", "80"),
                ServiceAttribute::new("proto", "tcp"),
            ]
        );
    }
}
