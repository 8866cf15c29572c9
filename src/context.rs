use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::fmt;
use uuid::Uuid;

/// The (client, company) pair that owns imported records.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub client: String,
    pub company: Option<String>,
}

impl TenantScope {
    pub fn client(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            company: None,
        }
    }

    pub fn company(client: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            company: Some(company.into()),
        }
    }

    /// Key used for client-wide counters, ignoring the company.
    pub fn client_key(&self) -> String {
        self.client.clone()
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.company {
            Some(company) => write!(f, "{}/{}", self.client, company),
            None => f.write_str(&self.client),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImportContext {
    pub tenant: TenantScope,
    pub actor: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub headers: JsonMap<String, Value>,
}

impl ImportContext {
    pub fn builder(tenant: TenantScope) -> ImportContextBuilder {
        ImportContextBuilder {
            tenant,
            actor: None,
            correlation_id: None,
            headers: JsonMap::new(),
        }
    }

    pub fn new(tenant: TenantScope) -> Self {
        Self::builder(tenant).build()
    }

    pub fn merge_headers(&mut self, headers: Value) {
        if let Value::Object(new) = headers {
            for (k, v) in new {
                self.headers.insert(k, v);
            }
        }
    }
}

pub struct ImportContextBuilder {
    tenant: TenantScope,
    actor: Option<String>,
    correlation_id: Option<Uuid>,
    headers: JsonMap<String, Value>,
}

impl ImportContextBuilder {
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn headers(mut self, headers: Value) -> Self {
        if let Value::Object(map) = headers {
            self.headers = map;
        }
        self
    }

    pub fn build(self) -> ImportContext {
        ImportContext {
            tenant: self.tenant,
            actor: self.actor,
            correlation_id: self.correlation_id,
            headers: self.headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tenant_display() {
        assert_eq!(TenantScope::client("acme").to_string(), "acme");
        assert_eq!(TenantScope::company("acme", "north").to_string(), "acme/north");
    }

    #[test]
    fn builder_merges_headers() {
        let mut ctx = ImportContext::builder(TenantScope::client("acme"))
            .actor("ops@acme")
            .headers(json!({"source": "csv"}))
            .build();
        ctx.merge_headers(json!({"batch": 7}));
        assert_eq!(ctx.actor.as_deref(), Some("ops@acme"));
        assert_eq!(ctx.headers.get("source"), Some(&json!("csv")));
        assert_eq!(ctx.headers.get("batch"), Some(&json!(7)));
    }
}
