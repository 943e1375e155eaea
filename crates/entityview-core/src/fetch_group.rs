//! Per-instance record of loaded attributes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::schema::{AttributeInfo, EntityMeta};
use crate::view::View;

/// The set of attributes actually populated on one entity instance.
///
/// A fetch group is derived from the [`View`] used to load the instance and
/// grows as attributes are fetched on access while the instance is managed.
/// Once the instance is detached the group is frozen: loads can no longer
/// extend it, although explicit writes still can.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchGroup {
    attributes: BTreeSet<String>,
    frozen: bool,
}

impl FetchGroup {
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: attributes.into_iter().map(Into::into).collect(),
            frozen: false,
        }
    }

    /// Group holding only the identity attribute (a reference stub).
    pub fn identity_only(meta: &EntityMeta) -> Self {
        Self::new([meta.id_attribute()])
    }

    /// Group produced by loading `meta` through `view`.
    ///
    /// `partial` is the root view's `load_partial_entities` flag.
    pub fn for_view(meta: &EntityMeta, view: &View, partial: bool) -> Self {
        let mut group = Self::identity_only(meta);
        group.attributes.extend(
            required_attributes(meta, Some(view), partial)
                .into_iter()
                .map(|a| a.name.clone()),
        );
        group
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.contains(attribute)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Record an attribute populated by a load. Ignored once frozen.
    pub fn add_loaded(&mut self, attribute: &str) -> bool {
        if self.frozen {
            tracing::trace!(attribute, "Fetch group frozen, load not recorded");
            return false;
        }
        self.attributes.insert(attribute.to_string())
    }

    /// Record an attribute supplied by an explicit write.
    pub fn add_written(&mut self, attribute: &str) {
        self.attributes.insert(attribute.to_string());
    }
}

/// Attributes (identity excluded) that loading `meta` through `view` must populate.
///
/// Without a view every scalar and to-one reference is loaded while to-many
/// collections stay lazy. With a view, its properties are loaded, plus system attributes when the view
/// includes them, plus every scalar unless `partial` is set.
pub fn required_attributes<'m>(
    meta: &'m EntityMeta,
    view: Option<&View>,
    partial: bool,
) -> Vec<&'m AttributeInfo> {
    meta.attributes()
        .iter()
        .filter(|a| !meta.is_identity(&a.name))
        .filter(|a| match view {
            None => !a.is_to_many(),
            Some(view) => {
                view.contains(&a.name)
                    || (a.system && view.is_include_system_properties())
                    || (!partial && a.is_scalar())
            }
        })
        .collect()
}
