use serde_json::Value;

/// A Django-ORM-style search query against one store resource type.
///
/// Conditions are `field__method=value` pairs; when no `__` appears the
/// method defaults to `exact`. A condition with several values means the
/// field appears multiple times in the document, each occurrence matching
/// one of the values (AND-of-repeated-subfields semantics).
///
/// ```
/// use qvarn_client::SearchQuery;
///
/// let query = SearchQuery::new()
///     .exact("_mr_source_id", "abc123")
///     .show("_mr_version");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    conditions: Vec<Condition>,
    show: Vec<String>,
    show_all: bool,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub method: String,
    pub field: String,
    pub values: Vec<Value>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition using the `field__method` key form. A bare field
    /// name means `exact`.
    pub fn filter(mut self, key: &str, value: impl Into<QueryValue>) -> Self {
        let (field, method) = match key.split_once("__") {
            Some((field, method)) => (field, method),
            None => (key, "exact"),
        };
        self.conditions.push(Condition {
            method: method.to_string(),
            field: field.to_string(),
            values: value.into().0,
        });
        self
    }

    /// Add an `exact` condition.
    pub fn exact(self, field: &str, value: impl Into<QueryValue>) -> Self {
        self.filter(field, value)
    }

    /// Project the result records down to `id` plus the given field.
    pub fn show(mut self, field: &str) -> Self {
        self.show.push(field.to_string());
        self
    }

    /// Return full records instead of ids.
    pub fn show_all(mut self) -> Self {
        self.show_all = true;
        self
    }

    pub fn has_projection(&self) -> bool {
        self.show_all || !self.show.is_empty()
    }

    /// Conditions ordered by `(method, field)` — the order in which they
    /// are sent to the store. The ordering is part of the store contract.
    pub fn ordered_conditions(&self) -> Vec<&Condition> {
        let mut conditions: Vec<&Condition> = self.conditions.iter().collect();
        conditions.sort_by(|a, b| (&a.method, &a.field).cmp(&(&b.method, &b.field)));
        conditions
    }

    pub fn shown_fields(&self) -> &[String] {
        &self.show
    }

    pub fn shows_all(&self) -> bool {
        self.show_all
    }

    /// Render the query as store URL path segments:
    /// `search/{method}/{field}/{value}…` followed by the projection
    /// (`show_all` or repeated `show/{field}`).
    pub fn path_segments(&self) -> Vec<String> {
        let mut segments = vec!["search".to_string()];
        for condition in self.ordered_conditions() {
            for value in &condition.values {
                segments.push(condition.method.clone());
                segments.push(condition.field.clone());
                segments.push(value_segment(value));
            }
        }
        if self.show_all {
            segments.push("show_all".to_string());
        } else {
            for field in &self.show {
                segments.push("show".to_string());
                segments.push(field.clone());
            }
        }
        segments
    }

    /// Compact description for error messages.
    pub fn describe(&self) -> String {
        self.ordered_conditions()
            .iter()
            .map(|c| {
                let values = c
                    .values
                    .iter()
                    .map(value_segment)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{}__{}={}", c.field, c.method, values)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn value_segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One or several condition values. Scalars come in as a single value;
/// a vector means the field must appear once per given value.
pub struct QueryValue(Vec<Value>);

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue(vec![Value::String(value.to_string())])
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue(vec![Value::String(value)])
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        QueryValue(vec![Value::from(value)])
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        QueryValue(vec![Value::Bool(value)])
    }
}

impl From<Value> for QueryValue {
    fn from(value: Value) -> Self {
        QueryValue(vec![value])
    }
}

impl From<&Value> for QueryValue {
    fn from(value: &Value) -> Self {
        QueryValue(vec![value.clone()])
    }
}

impl From<Vec<Value>> for QueryValue {
    fn from(values: Vec<Value>) -> Self {
        QueryValue(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_method_is_exact() {
        let query = SearchQuery::new().filter("email", "test@example.com");
        assert_eq!(
            query.path_segments(),
            vec!["search", "exact", "email", "test@example.com"]
        );
    }

    #[test]
    fn explicit_method_in_key() {
        let query = SearchQuery::new().filter("name__startswith", "Org");
        assert_eq!(
            query.path_segments(),
            vec!["search", "startswith", "name", "Org"]
        );
    }

    #[test]
    fn conditions_are_ordered_by_method_then_field() {
        let query = SearchQuery::new()
            .exact("zebra", "z")
            .filter("alpha__gt", "1")
            .exact("alpha", "a");
        assert_eq!(
            query.path_segments(),
            vec![
                "search", "exact", "alpha", "a", "exact", "zebra", "z", "gt", "alpha", "1",
            ]
        );
    }

    #[test]
    fn list_value_repeats_the_field() {
        let query = SearchQuery::new().exact(
            "resource_id",
            vec![json!("person-id"), json!("org-id")],
        );
        assert_eq!(
            query.path_segments(),
            vec![
                "search",
                "exact",
                "resource_id",
                "person-id",
                "exact",
                "resource_id",
                "org-id",
            ]
        );
    }

    #[test]
    fn show_and_show_all() {
        let query = SearchQuery::new().exact("_mr_key", 1).show("_mr_version");
        assert_eq!(
            query.path_segments(),
            vec!["search", "exact", "_mr_key", "1", "show", "_mr_version"]
        );

        let query = SearchQuery::new().exact("_mr_key", 1).show_all();
        assert_eq!(
            query.path_segments(),
            vec!["search", "exact", "_mr_key", "1", "show_all"]
        );
    }

    #[test]
    fn non_string_values_render_as_json() {
        let query = SearchQuery::new().exact("_mr_deleted", true).exact("count", 42);
        assert_eq!(
            query.path_segments(),
            vec![
                "search", "exact", "_mr_deleted", "true", "exact", "count", "42",
            ]
        );
    }
}
