//! Merge flat rows (one per CSV line) into nested documents.
//!
//! Price lists arrive as one row per quantity slab:
//!
//! ```text
//! name,item,min_qty,price
//! Retail,SKU-1,1,10.0
//! Retail,SKU-1,10,9.5
//! ```
//!
//! Grouping by `name,item` into `slabs` yields one document per price list entry with an
//! array of `{min_qty, price}` slabs.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowGrouping {
    pub key_fields: Vec<String>,
    pub nested_field: String,
    #[serde(default)]
    pub order_by: Option<String>,
}

impl RowGrouping {
    pub fn new<I, S>(key_fields: I, nested_field: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            nested_field: nested_field.into(),
            order_by: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// Group `rows` by the key fields, preserving first-seen order of groups and rows.
    /// Non-object rows pass through unchanged so validation can reject them later.
    pub fn group(&self, rows: Vec<Value>) -> Vec<Value> {
        let numbered = rows.into_iter().enumerate().map(|(i, row)| (i as u64, row));
        self.group_with_lines(numbered.collect())
            .into_iter()
            .map(|(doc, _)| doc)
            .collect()
    }

    /// [`group`](Self::group) for rows tagged with their source line; each document comes back
    /// with the lines merged into it.
    pub fn group_with_lines(&self, rows: Vec<(u64, Value)>) -> Vec<(Value, Vec<u64>)> {
        let mut out: Vec<Value> = Vec::new();
        let mut lines: Vec<Vec<u64>> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();

        for (line, row) in rows {
            let Value::Object(mut fields) = row else {
                out.push(row);
                lines.push(vec![line]);
                continue;
            };

            let mut parent = JsonMap::new();
            for key in &self.key_fields {
                if let Some(v) = fields.remove(key) {
                    parent.insert(key.clone(), v);
                }
            }
            let group_key = self.group_key(&parent);

            let idx = *slots.entry(group_key).or_insert_with(|| {
                parent.insert(self.nested_field.clone(), Value::Array(Vec::new()));
                out.push(Value::Object(parent));
                lines.push(Vec::new());
                out.len() - 1
            });
            lines[idx].push(line);
            if let Some(Value::Array(children)) = out[idx].get_mut(&self.nested_field) {
                children.push(Value::Object(fields));
            }
        }

        if let Some(order_field) = &self.order_by {
            for doc in &mut out {
                if let Some(Value::Array(children)) = doc.get_mut(&self.nested_field) {
                    children.sort_by(|a, b| {
                        let ka = numeric(a.get(order_field));
                        let kb = numeric(b.get(order_field));
                        ka.total_cmp(&kb)
                    });
                }
            }
        }

        out.into_iter().zip(lines).collect()
    }

    fn group_key(&self, parent: &JsonMap<String, Value>) -> String {
        self.key_fields
            .iter()
            .map(|k| match parent.get(k) {
                Some(Value::String(s)) => s.trim().to_lowercase(),
                Some(other) => other.to_string(),
                None => String::from("\u{0}"),
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

// Missing or non-numeric sort keys order last.
fn numeric(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::INFINITY),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(f64::INFINITY),
        _ => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_slabs_under_one_parent() {
        let rows = vec![
            json!({"name": "Retail", "item": "SKU-1", "min_qty": 10, "price": 9.5}),
            json!({"name": "Retail", "item": "SKU-2", "min_qty": 1, "price": 4.0}),
            json!({"name": "Retail", "item": "SKU-1", "min_qty": 1, "price": 10.0}),
        ];
        let grouping = RowGrouping::new(["name", "item"], "slabs").order_by("min_qty");
        let docs = grouping.group(rows);
        assert_eq!(docs.len(), 2);
        assert_eq!(
            docs[0],
            json!({
                "name": "Retail",
                "item": "SKU-1",
                "slabs": [
                    {"min_qty": 1, "price": 10.0},
                    {"min_qty": 10, "price": 9.5}
                ]
            })
        );
        assert_eq!(docs[1]["slabs"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn key_comparison_ignores_case_and_padding() {
        let rows = vec![
            json!({"name": "Retail ", "min_qty": "5"}),
            json!({"name": "retail", "min_qty": "1"}),
        ];
        let docs = RowGrouping::new(["name"], "slabs")
            .order_by("min_qty")
            .group(rows);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["name"], json!("Retail "));
        assert_eq!(docs[0]["slabs"][0]["min_qty"], json!("1"));
    }

    #[test]
    fn tracks_source_lines_per_group() {
        let rows = vec![
            (2, json!({"name": "Retail", "min_qty": 1})),
            (3, json!({"name": "Wholesale", "min_qty": 1})),
            (4, json!({"name": "retail", "min_qty": 5})),
        ];
        let grouped = RowGrouping::new(["name"], "slabs").group_with_lines(rows);
        let lines: Vec<Vec<u64>> = grouped.into_iter().map(|(_, l)| l).collect();
        assert_eq!(lines, vec![vec![2, 4], vec![3]]);
    }

    #[test]
    fn non_objects_pass_through() {
        let docs = RowGrouping::new(["name"], "slabs").group(vec![json!(3)]);
        assert_eq!(docs, vec![json!(3)]);
    }
}
