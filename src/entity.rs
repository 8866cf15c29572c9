use crate::{
    Error, Result, WithContext,
    context::TenantScope,
    grouping::RowGrouping,
    sequence::{CodeFormat, SequenceKey},
    validate::{MissingPolicy, RecordValidator},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::{collections::HashMap, path::Path};

/// Which part of the tenant a code counter is shared across.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeScope {
    Client,
    #[default]
    Company,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeConfig {
    /// Document field that receives the generated code.
    pub field: String,
    #[serde(default)]
    pub scope: CodeScope,
    /// Counter name; defaults to the entity type.
    #[serde(default)]
    pub counter: Option<String>,
    #[serde(default = "default_code_width")]
    pub width: usize,
    #[serde(default)]
    pub prefix: String,
}

fn default_code_width() -> usize {
    6
}

impl CodeConfig {
    pub fn new(field: impl Into<String>, width: usize) -> Self {
        Self {
            field: field.into(),
            scope: CodeScope::Company,
            counter: None,
            width,
            prefix: String::new(),
        }
    }

    pub fn format(&self) -> CodeFormat {
        CodeFormat {
            width: self.width,
            prefix: self.prefix.clone(),
        }
    }

    pub fn sequence_key(&self, entity_type: &str, tenant: &TenantScope) -> SequenceKey {
        let scope = match self.scope {
            CodeScope::Client => tenant.client_key(),
            CodeScope::Company => tenant.to_string(),
        };
        let counter = self.counter.as_deref().unwrap_or(entity_type);
        SequenceKey::new(scope, counter)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub entity_type: String,
    pub collection: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub missing_policy: MissingPolicy,
    #[serde(default)]
    pub code: Option<CodeConfig>,
    /// Fields whose combined value must be unique per tenant and collection.
    #[serde(default)]
    pub natural_key: Vec<String>,
    /// Values applied to fields a record leaves out.
    #[serde(default)]
    pub defaults: JsonMap<String, Value>,
    #[serde(default)]
    pub grouping: Option<RowGrouping>,
}

impl EntityConfig {
    pub fn new(entity_type: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            collection: collection.into(),
            required_fields: Vec::new(),
            missing_policy: MissingPolicy::Absent,
            code: None,
            natural_key: Vec::new(),
            defaults: JsonMap::new(),
            grouping: None,
        }
    }

    pub fn required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn missing_policy(mut self, policy: MissingPolicy) -> Self {
        self.missing_policy = policy;
        self
    }

    pub fn code(mut self, code: CodeConfig) -> Self {
        self.code = Some(code);
        self
    }

    pub fn natural_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.natural_key = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(field.into(), value);
        self
    }

    pub fn grouping(mut self, grouping: RowGrouping) -> Self {
        self.grouping = Some(grouping);
        self
    }

    pub fn validator(&self) -> RecordValidator {
        RecordValidator::new(self.required_fields.iter().cloned(), self.missing_policy)
    }

    /// Natural key of `record`: components trimmed, lowercased and joined by `|`.
    /// `None` when no key is configured or any component is missing.
    pub fn natural_key_of(&self, record: &Value) -> Option<String> {
        if self.natural_key.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(self.natural_key.len());
        for field in &self.natural_key {
            let part = match record.get(field)? {
                Value::Null => return None,
                Value::String(s) if s.trim().is_empty() => return None,
                Value::String(s) => s.trim().to_lowercase(),
                other => other.to_string(),
            };
            parts.push(part);
        }
        Some(parts.join("|"))
    }
}

#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    entities: HashMap<String, EntityConfig>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: EntityConfig) -> &mut Self {
        self.entities.insert(config.entity_type.clone(), config);
        self
    }

    pub fn with(mut self, config: EntityConfig) -> Self {
        self.register(config);
        self
    }

    pub fn get(&self, entity_type: &str) -> Result<&EntityConfig> {
        self.entities
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntity(entity_type.to_string()))
    }

    pub fn entity_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Parse a JSON array of entity configs.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let configs: Vec<EntityConfig> = serde_json::from_str(json)?;
        let mut registry = Self::new();
        for config in configs {
            if config.collection.trim().is_empty() {
                return Err(Error::Config(format!(
                    "entity `{}` has an empty collection name",
                    config.entity_type
                )));
            }
            if let Some(code) = &config.code {
                if code.width == 0 {
                    return Err(Error::Config(format!(
                        "entity `{}` has a zero code width",
                        config.entity_type
                    )));
                }
            }
            if registry.entities.contains_key(&config.entity_type) {
                return Err(Error::Config(format!(
                    "entity `{}` is configured twice",
                    config.entity_type
                )));
            }
            registry.register(config);
        }
        Ok(registry)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .context(format!("reading entity config {}", path.display()))?;
        Self::from_json_str(&raw).context(format!("parsing entity config {}", path.display()))
    }

    /// Back-office entities imported in bulk.
    pub fn erp_defaults() -> Self {
        Self::new()
            .with(
                EntityConfig::new("agent", "agents")
                    .required(["name"])
                    .code(CodeConfig {
                        scope: CodeScope::Client,
                        ..CodeConfig::new("agent_code", 6)
                    })
                    .natural_key(["name"]),
            )
            .with(
                EntityConfig::new("vendor", "vendors")
                    .required(["name"])
                    .code(CodeConfig::new("vendor_code", 6))
                    .natural_key(["name"])
                    .default_value("status", Value::from("active")),
            )
            .with(
                EntityConfig::new("customer", "customers")
                    .required(["name"])
                    .code(CodeConfig::new("customer_code", 6))
                    .natural_key(["name", "phone"])
                    .default_value("status", Value::from("active")),
            )
            .with(
                EntityConfig::new("stock_item", "stock_items")
                    .required(["name", "unit"])
                    .code(CodeConfig::new("item_code", 12))
                    .natural_key(["name"]),
            )
            .with(
                EntityConfig::new("product", "products")
                    .required(["name"])
                    .code(CodeConfig::new("product_code", 12))
                    .natural_key(["name"]),
            )
            .with(
                EntityConfig::new("godown", "godowns")
                    .required(["name"])
                    .code(CodeConfig::new("godown_code", 6))
                    .natural_key(["name"]),
            )
            .with(
                EntityConfig::new("price_list", "price_lists")
                    .required(["name", "item"])
                    .natural_key(["name", "item"])
                    .grouping(RowGrouping::new(["name", "item"], "slabs").order_by("min_qty")),
            )
    }
}
