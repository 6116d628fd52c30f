//! Tag registry
//!
//! Immutable lookup tables derived from a validated [`Config`]: tags keyed by
//! their fully-qualified `controller/tag` name, grouped per owning controller.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::config::{Config, ControllerConfig, DataType, RegisterType};

/// Build the fully-qualified name under which a tag is stored
pub fn qualify(controller: &str, tag: &str) -> String {
    format!("{}/{}", controller, tag)
}

/// A controller as known to the registry
#[derive(Debug, Clone)]
pub struct ControllerSpec {
    pub name: String,
    pub config: ControllerConfig,
}

/// A tag as known to the registry
#[derive(Debug, Clone, PartialEq)]
pub struct TagSpec {
    /// Name on the controller
    pub name: String,
    /// Owning controller
    pub controller: String,
    /// `controller/name`
    pub qualified: String,
    pub data_type: DataType,
    pub scale_factor: f64,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub address: Option<u16>,
    pub register: RegisterType,
}

#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    controllers: BTreeMap<String, ControllerSpec>,
    tags: BTreeMap<String, TagSpec>,
    by_controller: BTreeMap<String, Vec<TagSpec>>,
}

impl TagRegistry {
    /// Validate the configuration and build the lookup tables
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let controllers: BTreeMap<_, _> = config
            .controllers
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    ControllerSpec {
                        name: name.clone(),
                        config: cfg.clone(),
                    },
                )
            })
            .collect();

        let mut tags = BTreeMap::new();
        let mut by_controller: BTreeMap<String, Vec<TagSpec>> = controllers
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        for (name, tag) in &config.tags {
            let spec = TagSpec {
                name: name.clone(),
                controller: tag.controller.clone(),
                qualified: qualify(&tag.controller, name),
                data_type: tag.data_type,
                scale_factor: tag.scale_factor,
                unit: tag.unit.clone(),
                description: tag.description.clone(),
                address: tag.address,
                register: tag.register,
            };
            by_controller
                .entry(tag.controller.clone())
                .or_default()
                .push(spec.clone());
            tags.insert(spec.qualified.clone(), spec);
        }

        Ok(Self {
            controllers,
            tags,
            by_controller,
        })
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ControllerSpec> {
        self.controllers.values()
    }

    /// Look up a tag by its fully-qualified name
    pub fn tag(&self, qualified: &str) -> Option<&TagSpec> {
        self.tags.get(qualified)
    }

    /// Tags owned by one controller
    pub fn tags_for(&self, controller: &str) -> &[TagSpec] {
        self.by_controller
            .get(controller)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn qualified_names(&self) -> Vec<String> {
        self.tags.keys().cloned().collect()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}
