//! Optional content ("layers") as declared by a document, and the UI-ready
//! model derived from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::VisibilitySnapshot;
use crate::config::{BlankTitlePolicy, LayerConfig};

/// Raw layer metadata as declared by the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerMetadata {
    pub order: Vec<OrderEntry>,
    pub layers: BTreeMap<String, DeclaredLayer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEntry {
    Section(DeclaredSection),
    /// A layer referenced at the top level, outside any section.
    Layer(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredSection {
    pub title: Option<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredLayer {
    pub name: Option<String>,
    /// `None` when the document declares no default state.
    pub visible: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerGroup {
    pub title: String,
    pub members: Vec<LayerEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerVisibility(BTreeMap<String, bool>);

impl LayerVisibility {
    pub fn get(&self, layer_id: &str) -> Option<bool> {
        self.0.get(layer_id).copied()
    }

    pub fn contains(&self, layer_id: &str) -> bool {
        self.0.contains_key(layer_id)
    }

    /// Returns the previous value, or `None` if the layer is unknown (nothing is inserted).
    pub fn set(&mut self, layer_id: &str, visible: bool) -> Option<bool> {
        self.0
            .get_mut(layer_id)
            .map(|value| std::mem::replace(value, visible))
    }

    pub fn snapshot(&self) -> VisibilitySnapshot {
        VisibilitySnapshot::new(self.0.clone())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerModel {
    pub groups: Vec<LayerGroup>,
    pub visibility: LayerVisibility,
}

#[derive(Debug, Clone, Default)]
pub struct LayerModelBuilder {
    config: LayerConfig,
}

impl LayerModelBuilder {
    pub fn new(config: LayerConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, metadata: &LayerMetadata) -> LayerModel {
        let mut groups = Vec::new();
        let mut visibility = BTreeMap::new();

        for (index, entry) in metadata.order.iter().enumerate() {
            let OrderEntry::Section(section) = entry else {
                continue;
            };

            let members: Vec<LayerEntry> = section
                .members
                .iter()
                .filter_map(|id| {
                    let layer = metadata.layers.get(id)?;
                    visibility.insert(id.clone(), layer.visible.unwrap_or(true));
                    let label = match layer.name.as_deref() {
                        Some(name) if !name.is_empty() => name.to_string(),
                        _ => id.clone(),
                    };
                    Some(LayerEntry {
                        id: id.clone(),
                        label,
                    })
                })
                .collect();

            if members.is_empty() {
                continue;
            }

            groups.push(LayerGroup {
                title: self.section_title(section.title.as_deref(), index + 1),
                members,
            });
        }

        LayerModel {
            groups,
            visibility: LayerVisibility(visibility),
        }
    }

    fn section_title(&self, declared: Option<&str>, position: usize) -> String {
        let usable = declared.filter(|title| match self.config.blank_titles {
            BlankTitlePolicy::Placeholder => !title.is_empty(),
            BlankTitlePolicy::Trim => !title.trim().is_empty(),
            BlankTitlePolicy::Keep => true,
        });
        match usable {
            Some(title) => title.to_string(),
            None => format!("{} {}", self.config.placeholder_prefix, position),
        }
    }
}
